pub mod aggregate;
pub mod free_tree;
pub mod page_allocator;
pub mod page_pool;

pub use aggregate::AggregateAllocator;
pub use free_tree::FreeIntervalTree;
pub use page_allocator::PageAllocator;
pub use page_pool::PagePool;
