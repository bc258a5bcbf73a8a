pub mod bitmap;
pub mod registry;
pub mod subnet_allocator;

pub use bitmap::Bitmap;
pub use registry::AllocatorRegistry;
pub use subnet_allocator::SubnetAllocator;
