pub mod cidr;
pub mod ip;
pub mod local;

pub use cidr::CidrSet;
