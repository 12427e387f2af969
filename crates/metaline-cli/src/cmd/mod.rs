pub mod harvest;
pub mod identifiers;
