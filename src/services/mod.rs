pub mod clip;
pub mod face_matcher;
pub mod faces;
pub mod gateway;
pub mod query_intent;
pub mod queue;
pub mod ranker;
pub mod storage;
pub mod vision;
pub mod worker;
pub mod workers_ai;
