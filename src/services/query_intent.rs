use chrono::{Datelike, NaiveDate};
use serde::Serialize;

/// Meteorological seasons (northern hemisphere).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Season {
    Spring,
    Summer,
    Autumn,
    Winter,
}

impl Season {
    pub fn of_month(month: u32) -> Self {
        match month {
            3..=5 => Season::Spring,
            6..=8 => Season::Summer,
            9..=11 => Season::Autumn,
            _ => Season::Winter,
        }
    }

    fn from_word(word: &str) -> Option<Self> {
        match word {
            "spring" | "springtime" | "easter" => Some(Season::Spring),
            "summer" | "summertime" => Some(Season::Summer),
            "autumn" | "fall" | "halloween" | "thanksgiving" => Some(Season::Autumn),
            "winter" | "wintertime" | "christmas" | "xmas" | "snowy" => Some(Season::Winter),
            _ => None,
        }
    }
}

/// Temporal hints pulled out of a search query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryIntent {
    pub season: Option<Season>,
    /// Calendar year the query points at ("this year", "last year", "2023").
    pub year: Option<i32>,
}

impl QueryIntent {
    pub fn parse(query: &str, today: NaiveDate) -> Self {
        let lowered = query.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        let season = words.iter().find_map(|w| Season::from_word(w));

        let mut year = None;
        for pair in words.windows(2) {
            match (pair[0], pair[1]) {
                ("this", "year") => year = Some(today.year()),
                ("last", "year") => year = Some(today.year() - 1),
                _ => continue,
            }
            break;
        }
        if year.is_none() {
            year = words.iter().find_map(|w| {
                if w.len() != 4 {
                    return None;
                }
                let y: i32 = w.parse().ok()?;
                (1900..=today.year() + 1).contains(&y).then_some(y)
            });
        }

        Self { season, year }
    }

    /// Temporal queries already select by date; recency is not rewarded on top.
    pub fn is_temporal(&self) -> bool {
        self.season.is_some() || self.year.is_some()
    }
}
