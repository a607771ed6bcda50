pub mod evaluation_source;
pub mod flag_hashing;
pub mod flag_matching;
pub mod flag_models;
