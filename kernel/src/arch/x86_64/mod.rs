/// x86_64 architecture-specific modules

pub mod context;
