pub mod deployment;
pub mod writer;

pub use deployment::{paths, DeploymentConfig};
pub use writer::{ConfigWriter, JsonFileWriter, MemoryWriter};
