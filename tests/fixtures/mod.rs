//! Search result sets used by the ranking tests.

#![allow(dead_code)]

/// One raw similarity hit and the image content behind it.
#[derive(Debug, Clone)]
pub struct CandidateFixture {
    pub file_name: &'static str,
    pub similarity: f64,
    pub age_days: i64,
    pub is_favorite: bool,
    /// What the image shows; the keyword judge reads this.
    pub content: &'static str,
}

/// A burst of near-identical shots followed by a different photo, all from
/// the same afternoon.
pub const BURST_SET: &[CandidateFixture] = &[
    CandidateFixture {
        file_name: "IMG_0001.jpg",
        similarity: 0.82,
        age_days: 3,
        is_favorite: false,
        content: "dog on the beach",
    },
    CandidateFixture {
        file_name: "IMG_0002.jpg",
        similarity: 0.81,
        age_days: 3,
        is_favorite: false,
        content: "dog on the beach",
    },
    CandidateFixture {
        file_name: "IMG_0003.jpg",
        similarity: 0.80,
        age_days: 3,
        is_favorite: false,
        content: "dog on the beach",
    },
    CandidateFixture {
        file_name: "sunset_pier.jpg",
        similarity: 0.79,
        age_days: 3,
        is_favorite: false,
        content: "dog at sunset on the pier",
    },
];

/// Mixed hits where the vector search confuses vehicles.
pub const VEHICLE_SET: &[CandidateFixture] = &[
    CandidateFixture {
        file_name: "red_car.jpg",
        similarity: 0.78,
        age_days: 10,
        is_favorite: false,
        content: "a red car parked outside",
    },
    CandidateFixture {
        file_name: "commute.jpg",
        similarity: 0.72,
        age_days: 400,
        is_favorite: false,
        content: "a bicycle leaning on a wall",
    },
    CandidateFixture {
        file_name: "race_day.jpg",
        similarity: 0.65,
        age_days: 30,
        is_favorite: true,
        content: "bicycle race in the rain",
    },
    CandidateFixture {
        file_name: "scooter.jpg",
        similarity: 0.60,
        age_days: 5,
        is_favorite: false,
        content: "an electric scooter",
    },
];
