pub mod c;
pub mod cpp;
pub mod python;
