pub mod health;
pub mod proctoring;
