// Route handler modules

pub mod caption;
pub mod health;
