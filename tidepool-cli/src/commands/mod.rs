pub mod check;
pub mod projects;
pub mod serve;
