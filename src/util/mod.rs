pub mod http_date;
pub(crate) mod lock;
