pub mod desc;
pub mod list;
pub mod manager;

pub use desc::{RegionDesc, RegionId, RegionTable, RegionType, UnitRole};
pub use list::{RegionList, RegionListStats};
pub use manager::RegionManager;
