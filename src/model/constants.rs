// Time decay
pub const HALF_LIFE_DAYS: f64 = 1095.0;

// Public rating scale
pub const STARTER_RATING: f64 = 500.0;
pub const RATING_FLOOR: f64 = 0.0;
pub const RATING_CEILING: f64 = 2000.0;
/// Rating points separating two players when one is twice as likely to win
pub const POINTS_PER_DOUBLING: f64 = 100.0;

// Confidence tiers (games played)
pub const PROVISIONAL_GAMES: i32 = 10;
pub const EMERGING_GAMES: i32 = 50;
pub const ESTABLISHED_GAMES: i32 = 200;

// Solver
pub const CONVERGENCE_TOLERANCE: f64 = 1e-6;
pub const MAX_ITERATIONS: usize = 200;
pub const STRENGTH_FLOOR: f64 = 1e-9;
pub const INITIAL_STRENGTH: f64 = 1.0;

// Upstream scores are untrusted; a match expanding past this many games is malformed
pub const MAX_GAMES_PER_MATCH: i64 = 10_000;

pub const ALGORITHM_VERSION: &str = "bt-mm-v1";

// Disciplines that are not pool and never enter the rating
pub const EXCLUDED_DISCIPLINES: [&str; 5] = ["snooker", "pyramid", "piramida", "russian pyramid", "russian pool"];
