pub mod reaper;
pub mod selector;
pub mod session_repository;
pub mod upload_service;
