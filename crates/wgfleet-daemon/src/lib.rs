pub mod config;
pub mod netlink;
