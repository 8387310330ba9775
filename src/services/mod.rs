pub mod cart;
pub mod catalog;
pub mod coupons;
pub mod notifications;
pub mod orders;
pub mod payments;
pub mod uploads;
