pub mod cache;
pub mod client;
pub mod pager;
pub mod push;
pub mod reconcile;
