mod handler;
mod model;

pub use handler::{create_order, delete_order, get_order, list_orders, update_order};
pub use model::{CreateOrderRequest, Order, OrderStatus, UpdateOrderRequest};
