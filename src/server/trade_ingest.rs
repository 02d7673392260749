use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::db::enums::TradeSide;
use crate::db::models::{Bot, BotErrorEntry, NewBotError, NewTradeHistory, TradeHistoryEntry};
use crate::db::{Persistence, StoreError};
use crate::server::subscription_manager::{HubEvent, SubscriptionManager};
use crate::services::exchange_service::ExchangeData;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Invalid event: {0}")]
    Validation(String),
    #[error("No bot with container name {0}")]
    UnknownBot(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A fill as bots report it: `{container_name, action, data: {orderId, ...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeEventPayload {
    pub container_name: String,
    pub action: String,
    pub data: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorEventPayload {
    pub container_name: String,
    pub error: String,
}

/// Result of dispatching one raw bot message.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    Trade(TradeHistoryEntry),
    Error(BotErrorEntry),
    Ignored,
}

/// The fields of a fill that get their own columns.
#[derive(Debug, Clone, PartialEq)]
struct Fill {
    order_id: String,
    side: TradeSide,
    symbol: Option<String>,
    avg_price: f64,
    qty: f64,
    timestamp: i64,
}

/// Validates and persists what bots report, then notifies the bot's owner.
pub struct IngestPipeline {
    store: Arc<dyn Persistence>,
    exchange: Arc<dyn ExchangeData>,
    hub: Arc<SubscriptionManager>,
    pnl_timeout: Duration,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn Persistence>,
        exchange: Arc<dyn ExchangeData>,
        hub: Arc<SubscriptionManager>,
        pnl_timeout: Duration,
    ) -> Self {
        Self {
            store,
            exchange,
            hub,
            pnl_timeout,
        }
    }

    /// Dispatches a raw message from the bot socket. Messages carrying an
    /// `action` are fills, messages carrying an `error` are error reports,
    /// anything else is logged and dropped.
    pub async fn ingest_message(&self, message: Value) -> Result<Ingested, IngestError> {
        let has = |key: &str| message.get(key).is_some_and(|v| !v.is_null());
        let (is_trade, is_error) = (has("action"), has("error"));
        if is_trade {
            let payload: TradeEventPayload =
                serde_json::from_value(message).map_err(|e| IngestError::Validation(e.to_string()))?;
            self.ingest_trade_event(payload).await.map(Ingested::Trade)
        } else if is_error {
            let payload: ErrorEventPayload =
                serde_json::from_value(message).map_err(|e| IngestError::Validation(e.to_string()))?;
            self.ingest_error_event(payload).await.map(Ingested::Error)
        } else {
            debug!(message = %message, "Ignoring bot message without action or error.");
            Ok(Ingested::Ignored)
        }
    }

    pub async fn ingest_trade_event(&self, payload: TradeEventPayload) -> Result<TradeHistoryEntry, IngestError> {
        let fill = parse_fill(&payload)?;
        let bot = self.resolve_bot(&payload.container_name).await?;

        let realized_pnl = match fill.side {
            TradeSide::Sell => {
                let symbol = fill.symbol.as_deref().unwrap_or(&bot.symbol);
                self.lookup_pnl(bot.id, &fill.order_id, symbol).await
            }
            TradeSide::Buy => None,
        };

        let entry = self
            .store
            .save_trade_history(NewTradeHistory {
                bot_id: bot.id,
                container_name: bot.container_name.clone(),
                order_id: fill.order_id,
                side: fill.side,
                qty: fill.qty,
                avg_price: fill.avg_price,
                realized_pnl,
                info: payload.data,
                timestamp: fill.timestamp,
            })
            .await?;
        info!(
            bot_id = bot.id,
            order_id = %entry.order_id,
            side = %entry.side,
            qty = entry.qty,
            avg_price = entry.avg_price,
            "Trade fill recorded."
        );

        self.hub.publish(bot.owner_id, HubEvent::TradeFilled(entry.clone()));
        Ok(entry)
    }

    pub async fn ingest_error_event(&self, payload: ErrorEventPayload) -> Result<BotErrorEntry, IngestError> {
        if payload.error.trim().is_empty() {
            return Err(IngestError::Validation("error message is empty".to_string()));
        }
        let bot = self.resolve_bot(&payload.container_name).await?;
        let entry = self
            .store
            .save_bot_error(NewBotError {
                bot_id: bot.id,
                container_name: bot.container_name.clone(),
                error: payload.error,
            })
            .await?;
        warn!(bot_id = bot.id, error = %entry.error, "Bot reported an error.");

        self.hub.publish(bot.owner_id, HubEvent::BotError(entry.clone()));
        Ok(entry)
    }

    async fn resolve_bot(&self, container_name: &str) -> Result<Bot, IngestError> {
        if container_name.trim().is_empty() {
            return Err(IngestError::Validation("container_name is required".to_string()));
        }
        self.store
            .find_bot_by_container_name(container_name)
            .await?
            .ok_or_else(|| IngestError::UnknownBot(container_name.to_string()))
    }

    /// Realized PnL of a SELL fill. Lookup failures never block the fill from
    /// being recorded.
    async fn lookup_pnl(&self, bot_id: i32, order_id: &str, symbol: &str) -> Option<f64> {
        match timeout(self.pnl_timeout, self.exchange.lookup_realized_pnl(order_id, symbol)).await {
            Ok(Ok(pnl)) => Some(pnl),
            Ok(Err(e)) => {
                warn!(bot_id, order_id, error = %e, "Realized PnL lookup failed.");
                None
            }
            Err(_) => {
                warn!(bot_id, order_id, timeout_ms = self.pnl_timeout.as_millis() as u64, "Realized PnL lookup timed out.");
                None
            }
        }
    }
}

fn parse_fill(payload: &TradeEventPayload) -> Result<Fill, IngestError> {
    let data = payload
        .data
        .as_object()
        .ok_or_else(|| IngestError::Validation("data must be an object".to_string()))?;

    let order_id = match data.get("orderId") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(IngestError::Validation("orderId is required".to_string())),
    };

    let side_text = data
        .get("side")
        .and_then(Value::as_str)
        .unwrap_or(payload.action.as_str());
    let side = side_text
        .parse::<TradeSide>()
        .map_err(|_| IngestError::Validation(format!("unknown side '{side_text}'")))?;

    let avg_price = decimal_field(data.get("avgPrice"))
        .ok_or_else(|| IngestError::Validation("avgPrice must be a number".to_string()))?;
    let qty = decimal_field(data.get("executedQty"))
        .filter(|q| *q > 0.0)
        .or_else(|| decimal_field(data.get("origQty")))
        .ok_or_else(|| IngestError::Validation("executedQty or origQty is required".to_string()))?;
    if avg_price < 0.0 || qty <= 0.0 {
        return Err(IngestError::Validation("avgPrice and quantity must be positive".to_string()));
    }

    let timestamp = data
        .get("updateTime")
        .and_then(Value::as_i64)
        .unwrap_or_else(|| Utc::now().timestamp_millis());

    Ok(Fill {
        order_id,
        side,
        symbol: data.get("symbol").and_then(Value::as_str).map(str::to_string),
        avg_price,
        qty,
        timestamp,
    })
}

/// Exchanges send decimals as strings ("2052.43000"); accept plain numbers too.
fn decimal_field(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::db::enums::BotStatus;
    use crate::db::models::NewBot;
    use crate::testing::{MockExchange, bot_spec};
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryStore>,
        exchange: Arc<MockExchange>,
        hub: Arc<SubscriptionManager>,
        pipeline: IngestPipeline,
        bot: Bot,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let exchange = Arc::new(MockExchange::new());
        let hub = Arc::new(SubscriptionManager::new(16));
        let spec = bot_spec("cool_bot", 110);
        let bot = store
            .save_bot(NewBot {
                container_name: spec.container_name(),
                spec,
                worker_instance_id: Some("w-1".to_string()),
                status: BotStatus::Running,
            })
            .await
            .unwrap();
        let pipeline = IngestPipeline::new(store.clone(), exchange.clone(), hub.clone(), Duration::from_millis(100));
        Fixture {
            store,
            exchange,
            hub,
            pipeline,
            bot,
        }
    }

    fn fill_message(container_name: &str, side: &str, order_id: Value) -> Value {
        json!({
            "container_name": container_name,
            "action": side.to_lowercase(),
            "data": {
                "orderId": order_id,
                "symbol": "ETHUSDT",
                "status": "FILLED",
                "avgPrice": "2052.43000",
                "origQty": "0.100",
                "executedQty": "0.100",
                "side": side,
                "updateTime": 1_700_000_000_000i64
            }
        })
    }

    #[tokio::test]
    async fn test_buy_fill_is_persisted_and_published() {
        let f = fixture().await;
        let mut sub = f.hub.subscribe(f.bot.owner_id);

        let outcome = f
            .pipeline
            .ingest_message(fill_message("User1_supertrend_cool_bot", "BUY", json!("1211943298")))
            .await
            .unwrap();
        let Ingested::Trade(entry) = outcome else {
            panic!("expected a trade, got {outcome:?}");
        };
        assert_eq!(entry.order_id, "1211943298");
        assert_eq!(entry.side, TradeSide::Buy);
        assert_eq!(entry.qty, 0.1);
        assert_eq!(entry.avg_price, 2052.43);
        assert_eq!(entry.realized_pnl, None);
        assert_eq!(entry.timestamp, 1_700_000_000_000);
        assert_eq!(entry.info["status"], "FILLED");
        assert_eq!(f.exchange.calls(), 0);

        assert_eq!(f.store.list_trade_history(f.bot.id).await.unwrap(), vec![entry.clone()]);
        assert_eq!(*sub.receiver.recv().await.unwrap(), HubEvent::TradeFilled(entry));
    }

    #[tokio::test]
    async fn test_sell_fill_is_enriched_with_realized_pnl() {
        let f = fixture().await;
        f.exchange.set_pnl("42", 12.5);

        let entry = match f
            .pipeline
            .ingest_message(fill_message("User1_supertrend_cool_bot", "SELL", json!(42)))
            .await
            .unwrap()
        {
            Ingested::Trade(entry) => entry,
            other => panic!("expected a trade, got {other:?}"),
        };
        assert_eq!(entry.order_id, "42");
        assert_eq!(entry.realized_pnl, Some(12.5));
    }

    #[tokio::test]
    async fn test_sell_fill_survives_failed_lookup() {
        let f = fixture().await;
        f.exchange.set_failing(true);
        let payload: TradeEventPayload =
            serde_json::from_value(fill_message("User1_supertrend_cool_bot", "SELL", json!("7"))).unwrap();

        let entry = f.pipeline.ingest_trade_event(payload).await.unwrap();
        assert_eq!(entry.realized_pnl, None);
        assert_eq!(f.store.list_trade_history(f.bot.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_slow_lookup_is_bounded() {
        let f = fixture().await;
        f.exchange.set_pnl("7", 1.0);
        f.exchange.set_delay(Duration::from_secs(5));
        let payload: TradeEventPayload =
            serde_json::from_value(fill_message("User1_supertrend_cool_bot", "SELL", json!("7"))).unwrap();

        let started = std::time::Instant::now();
        let entry = f.pipeline.ingest_trade_event(payload).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(entry.realized_pnl, None);
    }

    #[tokio::test]
    async fn test_invalid_fill_is_not_persisted() {
        let f = fixture().await;
        let mut message = fill_message("User1_supertrend_cool_bot", "BUY", json!("1"));
        message["data"]["avgPrice"] = json!("not-a-price");

        let err = f.pipeline.ingest_message(message).await.unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));

        let missing_order = json!({
            "container_name": "User1_supertrend_cool_bot",
            "action": "buy",
            "data": {"avgPrice": "1", "executedQty": "1", "side": "BUY"}
        });
        assert!(matches!(
            f.pipeline.ingest_message(missing_order).await,
            Err(IngestError::Validation(_))
        ));
        assert!(f.store.list_trade_history(f.bot.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_container_is_rejected() {
        let f = fixture().await;
        let err = f
            .pipeline
            .ingest_message(fill_message("User9_nobody_bot", "BUY", json!("1")))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::UnknownBot(name) if name == "User9_nobody_bot"));
    }

    #[tokio::test]
    async fn test_error_event_is_persisted_and_published() {
        let f = fixture().await;
        let mut sub = f.hub.subscribe(f.bot.owner_id);

        let outcome = f
            .pipeline
            .ingest_message(json!({"container_name": "User1_supertrend_cool_bot", "error": "insufficient margin"}))
            .await
            .unwrap();
        let Ingested::Error(entry) = outcome else {
            panic!("expected an error entry, got {outcome:?}");
        };
        assert_eq!(entry.bot_id, f.bot.id);
        assert_eq!(entry.error, "insufficient margin");
        assert_eq!(f.store.bot_errors().await.len(), 1);
        assert_eq!(*sub.receiver.recv().await.unwrap(), HubEvent::BotError(entry));
    }

    #[tokio::test]
    async fn test_other_messages_are_ignored() {
        let f = fixture().await;
        let outcome = f.pipeline.ingest_message(json!({"message": "hello"})).await.unwrap();
        assert_eq!(outcome, Ingested::Ignored);
    }

    #[test]
    fn test_qty_falls_back_to_orig_qty() {
        let payload = TradeEventPayload {
            container_name: "c".to_string(),
            action: "sell".to_string(),
            data: json!({"orderId": 5, "avgPrice": 10.5, "origQty": "2", "executedQty": "0"}),
        };
        let fill = parse_fill(&payload).unwrap();
        assert_eq!(fill.qty, 2.0);
        assert_eq!(fill.side, TradeSide::Sell);
        assert_eq!(fill.symbol, None);
    }
}
