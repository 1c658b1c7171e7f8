//! Rating model: turning tournament payloads into games and games into ratings.
//!
//! Data flows `payload` -> `normalizer` -> games in the store -> `graph` -> `bradley_terry`
//! -> `confidence`, with `replay` driving the last three once per weekly checkpoint.

pub mod bradley_terry;
pub mod confidence;
pub mod constants;
pub mod decay;
pub mod graph;
pub mod normalizer;
pub mod payload;
pub mod replay;
pub mod structures;
