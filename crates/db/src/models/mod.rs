pub mod job_record;
