//! Entrada do pipeline: criação de pedidos.
//!
//! Valida a requisição, grava o pedido como CRIADO e entrega o evento ao pool
//! de despacho. Quem chama só vê erros de validação e de persistência; falhas
//! de publicação ficam nos logs.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::dispatch::DispatchPool;
use crate::error::ServiceError;
use crate::gateway::{OrderRepository, with_store_deadline};
use crate::order::{CreateOrderRequest, CreateOrderResponse, Order};

pub struct OrderService {
    repo: Arc<dyn OrderRepository>,
    dispatcher: Arc<DispatchPool>,
    store_timeout: Duration,
}

impl OrderService {
    pub fn new(repo: Arc<dyn OrderRepository>, dispatcher: Arc<DispatchPool>, store_timeout: Duration) -> Self {
        Self {
            repo,
            dispatcher,
            store_timeout,
        }
    }

    /// Persists a new CRIADO order and queues its status-change event.
    ///
    /// Returns as soon as the order is stored; the transition happens later.
    pub async fn create_order(&self, request: CreateOrderRequest) -> Result<CreateOrderResponse, ServiceError> {
        validate(&request)?;

        let order = Order::new(request.product.trim().to_string(), request.quantity);
        with_store_deadline(self.store_timeout, self.repo.create(&order))
            .await
            .map_err(ServiceError::Persist)?;
        info!(order_id = %order.order_id, product = %order.product, quantity = order.quantity, "pedido criado");

        if let Err(err) = self.dispatcher.submit_order_created(&order).await {
            error!(order_id = %order.order_id, error = %err, "erro ao enfileirar evento do pedido");
        }

        Ok(CreateOrderResponse {
            order_id: order.order_id,
            status: order.status,
        })
    }
}

fn validate(request: &CreateOrderRequest) -> Result<(), ServiceError> {
    if request.product.trim().is_empty() {
        return Err(ServiceError::Validation("Campo 'product' é obrigatório".into()));
    }
    if request.quantity == 0 {
        return Err(ServiceError::Validation("Campo 'quantity' deve ser maior que zero".into()));
    }
    Ok(())
}
