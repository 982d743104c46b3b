pub mod answer;
pub mod query;
pub mod question;
pub mod result_set;
pub mod session;
