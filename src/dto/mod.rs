pub mod proctoring_dto;
