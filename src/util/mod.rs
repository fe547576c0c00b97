pub mod assert;
pub mod hint;
