pub mod loader;
pub mod types;

pub use loader::{DataConfig, DataLoader, LoaderError};
pub use types::{Dataset, MarketSeries, RegimeTable, ValueKind};
