pub mod job_record_repo;

pub use job_record_repo::PgJobRegistry;
