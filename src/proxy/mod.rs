pub mod health;
pub mod manager;
pub mod pool;
