pub mod region_bitmap;
pub mod work_stack;
