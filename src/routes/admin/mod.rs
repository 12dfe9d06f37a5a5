pub mod set_price;
