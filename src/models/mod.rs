pub mod proctoring;
