pub mod caldav;
pub mod crypto;
pub mod ical;
pub mod init;
pub mod sync;
