mod fs;
mod memory;

pub use fs::FsFileRepository;
pub use memory::MemoryFileRepository;
