pub mod admin;
pub mod agent;
pub mod analysis;
pub mod auth_session;
pub mod cluster;
pub mod dashboard;
pub mod e2ee;
pub mod machine;
pub mod ui;
