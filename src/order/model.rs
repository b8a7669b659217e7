use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The three states an order moves through.
///
/// The derived ordering follows the lifecycle: CRIADO < PROCESSANDO < PROCESSADO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Criado,
    Processando,
    Processado,
}

impl OrderStatus {
    /// The state that follows this one, or `None` for the terminal state.
    pub fn next(self) -> Option<OrderStatus> {
        match self {
            OrderStatus::Criado => Some(OrderStatus::Processando),
            OrderStatus::Processando => Some(OrderStatus::Processado),
            OrderStatus::Processado => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.next().is_none()
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Criado => write!(f, "CRIADO"),
            OrderStatus::Processando => write!(f, "PROCESSANDO"),
            OrderStatus::Processado => write!(f, "PROCESSADO"),
        }
    }
}

/// An order as persisted by the status store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub product: String,
    pub quantity: u32,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Creates a fresh order in `CRIADO` with a newly generated identifier.
    pub fn new(product: String, quantity: u32) -> Self {
        let now = Utc::now();
        Self {
            order_id: Uuid::new_v4().to_string(),
            product,
            quantity,
            status: OrderStatus::Criado,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Wire payload asking the consumer side to move an order to `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChangeEvent {
    pub order_id: String,
    pub status: OrderStatus,
}

impl StatusChangeEvent {
    /// The event emitted right after an order is created.
    pub fn processing(order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            status: OrderStatus::Processando,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

/// Body of an order-creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub product: String,
    pub quantity: u32,
}

/// Answer to an order-creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrderResponse {
    pub order_id: String,
    pub status: OrderStatus,
}
