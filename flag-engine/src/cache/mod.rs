pub mod flag_cache;
pub mod notification;

pub use flag_cache::{FlagCache, FlagCacheSettings};
pub use notification::{
    ChangeNotifier, InvalidationListener, InvalidationMessage, LocalChangeNotifier,
    NotifierError, RedisChangeNotifier,
};
