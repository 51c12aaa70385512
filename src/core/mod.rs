pub mod cursor;
pub mod models;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
