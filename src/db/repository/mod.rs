pub mod appointment_repository;
pub mod connection_repository;
pub mod pending_mapping_repository;
pub mod sync_log_repository;

pub use appointment_repository::AppointmentRepository;
pub use connection_repository::ConnectionRepository;
pub use pending_mapping_repository::PendingMappingRepository;
pub use sync_log_repository::SyncLogRepository;
