mod model;
mod transition;

pub use model::{CreateOrderRequest, CreateOrderResponse, Order, OrderStatus, StatusChangeEvent};
pub use transition::{OrderTransition, TransitionConfig, TransitionReport};
