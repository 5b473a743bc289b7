pub mod driver;
pub mod fault;
pub mod registers;
