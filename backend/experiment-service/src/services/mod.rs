/// Business logic layer
pub mod experiments;
