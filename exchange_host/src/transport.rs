pub mod backoff;
pub mod serial_link;
