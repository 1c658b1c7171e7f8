pub mod confidence_tier;
