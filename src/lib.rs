//! Pipeline assíncrono de status de pedidos.
//!
//! Um pedido nasce CRIADO, um evento é publicado por um pool de despacho
//! com fila limitada, e um pool de consumo com prefetch controlado leva o
//! pedido a PROCESSANDO e depois a PROCESSADO, confirmando ou rejeitando
//! cada entrega.

pub mod config;
pub mod consumer;
pub mod demo;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod order;
pub mod service;
pub mod shutdown;
pub mod telemetry;
pub mod ui;
