pub mod deploy;
pub mod destroy;
pub mod status;
pub mod validate;
