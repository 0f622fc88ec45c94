//! Local knowledge storage: content addressing, the compensating asset store,
//! pending update state and finality bookkeeping.

pub mod assets;
pub mod finality;
pub mod pending;

pub use assets::{
    assertion_size, calculate_assertion_id, default_keyword, format_ual, parse_ual, AssetStore,
    StoreOutcome, Ual,
};
pub use finality::FinalityStore;
pub use pending::{PendingState, PendingStorage};
