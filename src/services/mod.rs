pub mod merge_queue;
pub mod merge_service;
pub mod proctoring_service;
pub mod storage_service;
