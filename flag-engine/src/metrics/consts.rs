// Evaluation
pub const FLAG_EVALUATIONS_COUNTER: &str = "flags_engine_evaluations_total";
pub const FLAG_EVALUATION_TIME: &str = "flags_engine_evaluation_time";
pub const FLAG_EVALUATE_ALL_TIME: &str = "flags_engine_evaluate_all_time";
pub const FLAG_FAIL_OPEN_COUNTER: &str = "flags_engine_fail_open_total";

// Cache tiers
pub const FLAG_CACHE_HIT_COUNTER: &str = "flags_engine_cache_hit_total";
pub const FLAG_CACHE_MISS_COUNTER: &str = "flags_engine_cache_miss_total";
pub const FLAG_CACHE_INVALIDATION_ERRORS_COUNTER: &str = "flags_engine_cache_invalidation_errors_total";

// Store
pub const STORE_READS_COUNTER: &str = "flags_engine_store_reads_total";
pub const STORE_READ_ERRORS_COUNTER: &str = "flags_engine_store_read_errors_total";
pub const STORE_READ_TIME: &str = "flags_engine_store_read_time";

// Invalidation bus
pub const INVALIDATIONS_PUBLISHED_COUNTER: &str = "flags_engine_invalidations_published_total";
pub const INVALIDATIONS_PUBLISH_FAILED_COUNTER: &str =
    "flags_engine_invalidations_publish_failed_total";
pub const INVALIDATIONS_RECEIVED_COUNTER: &str = "flags_engine_invalidations_received_total";
pub const INVALIDATION_RESUBSCRIBE_COUNTER: &str = "flags_engine_invalidation_resubscribe_total";

// Admin
pub const FLAG_MUTATIONS_COUNTER: &str = "flags_engine_mutations_total";
pub const FLAG_MUTATION_CONFLICTS_COUNTER: &str = "flags_engine_mutation_conflicts_total";
pub const KILL_SWITCH_COUNTER: &str = "flags_engine_kill_switch_total";

// Rollout controller
pub const ROLLOUT_TICKS_COUNTER: &str = "flags_engine_rollout_ticks_total";
pub const ROLLOUT_ADVANCES_COUNTER: &str = "flags_engine_rollout_advances_total";
pub const ROLLOUT_ABORTS_COUNTER: &str = "flags_engine_rollout_aborts_total";
pub const ROLLOUT_TICK_ERRORS_COUNTER: &str = "flags_engine_rollout_tick_errors_total";
