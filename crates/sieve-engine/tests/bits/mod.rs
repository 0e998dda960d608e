pub mod testio;
