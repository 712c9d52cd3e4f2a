pub mod backup_exchange;
pub mod billing;
pub mod core;
pub mod school_years;
pub mod students;
pub mod tuition;
