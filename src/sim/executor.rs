//! Simulated order executor
//!
//! Fills market orders against the current mark price with configurable
//! basis-point fee and slippage, keeps virtual position and capital
//! accounting, and records one swap event per fill. Protective exits carry
//! a pinned price and fill at that level without slippage, modelling a
//! resting order.
//!
//! Short positions are tracked against a synthetic `{SYMBOL}-SHORT` asset:
//! entry proceeds land in capital immediately and the mark-to-market
//! balance subtracts the cost of buying the exposure back.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::ports::{
    ExecutorPort, OrderRequest, OrderResult, OrderStatus, OrderType, PositionInfo,
};
use crate::types::{Side, SwapEvent, TradeDirection};

pub struct SimulatedExecutor {
    symbol: String,
    starting_capital: f64,
    fee_rate: f64,
    slippage_rate: f64,

    capital_usd: f64,
    position: Option<PositionInfo>,

    current_price: f64,
    current_bar: usize,
    current_ts: i64,

    order_seq: u64,
    swap_seq: u64,
    /// Swaps since the last drain; the runner forwards them to the event log.
    pending_swaps: Vec<SwapEvent>,

    total_fees_usd: f64,
    total_slippage_usd: f64,
}

impl SimulatedExecutor {
    pub fn new(
        symbol: impl Into<String>,
        starting_capital: f64,
        fee_bps: f64,
        slippage_bps: f64,
    ) -> Self {
        SimulatedExecutor {
            symbol: symbol.into(),
            starting_capital,
            fee_rate: fee_bps / 10_000.0,
            slippage_rate: slippage_bps / 10_000.0,
            capital_usd: starting_capital,
            position: None,
            current_price: 0.0,
            current_bar: 0,
            current_ts: 0,
            order_seq: 0,
            swap_seq: 0,
            pending_swaps: Vec::new(),
            total_fees_usd: 0.0,
            total_slippage_usd: 0.0,
        }
    }

    /// Restore initial capital and clear all run state.
    pub fn reset(&mut self) {
        self.capital_usd = self.starting_capital;
        self.position = None;
        self.current_price = 0.0;
        self.current_bar = 0;
        self.current_ts = 0;
        self.order_seq = 0;
        self.swap_seq = 0;
        self.pending_swaps.clear();
        self.total_fees_usd = 0.0;
        self.total_slippage_usd = 0.0;
    }

    pub fn total_fees_usd(&self) -> f64 {
        self.total_fees_usd
    }

    pub fn total_slippage_usd(&self) -> f64 {
        self.total_slippage_usd
    }

    fn short_asset(&self) -> String {
        format!("{}-SHORT", self.symbol)
    }

    fn mark_to_market(&self) -> f64 {
        match &self.position {
            Some(pos) => match pos.direction {
                TradeDirection::Long => self.capital_usd + pos.size * self.current_price,
                // short proceeds already sit in capital; closing costs
                // size * price
                TradeDirection::Short => self.capital_usd - pos.size * self.current_price,
            },
            None => self.capital_usd,
        }
    }

    /// Slippage-adjusted fill price, or the pinned level for resting orders.
    fn fill_price(&self, side: Side, pinned: Option<f64>) -> (f64, bool) {
        match pinned {
            Some(level) => (level, true),
            None => {
                let adjusted = match side {
                    Side::Buy => self.current_price * (1.0 + self.slippage_rate),
                    Side::Sell => self.current_price * (1.0 - self.slippage_rate),
                };
                (adjusted, false)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_swap(
        &mut self,
        from_asset: String,
        to_asset: String,
        from_amount: f64,
        to_amount: f64,
        price: f64,
        fee_usd: f64,
        slippage_usd: f64,
        is_entry: Option<bool>,
        trade_direction: Option<TradeDirection>,
    ) -> u64 {
        self.swap_seq += 1;
        self.total_fees_usd += fee_usd;
        self.total_slippage_usd += slippage_usd;
        self.pending_swaps.push(SwapEvent {
            id: self.swap_seq,
            timestamp: self.current_ts,
            bar_index: self.current_bar,
            from_asset,
            to_asset,
            from_amount,
            to_amount,
            price,
            fee_usd,
            slippage_usd,
            is_entry,
            trade_direction,
        });
        self.swap_seq
    }

    fn reject(&mut self, req: &OrderRequest, reason: impl Into<String>) -> OrderResult {
        self.order_seq += 1;
        let reason = reason.into();
        warn!(order = %req.client_order_id, %reason, "order rejected");
        OrderResult {
            order_id: self.order_seq,
            client_order_id: req.client_order_id.clone(),
            status: OrderStatus::Rejected,
            filled_amount: 0.0,
            avg_price: 0.0,
            total_value_usd: 0.0,
            fee_usd: 0.0,
            slippage_usd: 0.0,
            timestamp: self.current_ts,
            reject_reason: Some(reason),
        }
    }

    fn filled(
        &mut self,
        req: &OrderRequest,
        asset_amount: f64,
        price: f64,
        value_usd: f64,
        fee_usd: f64,
        slippage_usd: f64,
    ) -> OrderResult {
        self.order_seq += 1;
        debug!(
            order = %req.client_order_id,
            side = ?req.side,
            price,
            value_usd,
            fee_usd,
            "order filled"
        );
        OrderResult {
            order_id: self.order_seq,
            client_order_id: req.client_order_id.clone(),
            status: OrderStatus::Filled,
            filled_amount: asset_amount,
            avg_price: price,
            total_value_usd: value_usd,
            fee_usd,
            slippage_usd,
            timestamp: self.current_ts,
            reject_reason: None,
        }
    }

    fn open_long(&mut self, req: &OrderRequest) -> OrderResult {
        let (fill, pinned) = self.fill_price(Side::Buy, req.limit_price);
        let mut amount_usd = match req.amount_usd.or(req.amount_asset.map(|a| a * fill)) {
            Some(a) if a > 0.0 => a,
            _ => return self.reject(req, "missing or non-positive order amount"),
        };

        // auto-reduce a buy that would overdraw capital
        let max_amount = self.capital_usd / (1.0 + self.fee_rate);
        if amount_usd > max_amount {
            warn!(
                requested = amount_usd,
                reduced = max_amount,
                "insufficient capital, reducing buy"
            );
            amount_usd = max_amount;
        }
        if amount_usd <= 0.0 {
            return self.reject(req, "no capital available");
        }

        let asset = amount_usd / fill;
        let fee = amount_usd * self.fee_rate;
        let slippage = if pinned {
            0.0
        } else {
            asset * (fill - self.current_price).abs()
        };

        self.capital_usd -= amount_usd + fee;
        match self.position.as_mut() {
            Some(pos) if pos.direction == TradeDirection::Long => {
                // size-weighted average entry
                let total = pos.size + asset;
                pos.entry_price = (pos.entry_price * pos.size + fill * asset) / total;
                pos.size = total;
                pos.size_usd += amount_usd;
            }
            _ => {
                self.position = Some(PositionInfo {
                    symbol: self.symbol.clone(),
                    direction: TradeDirection::Long,
                    size: asset,
                    size_usd: amount_usd,
                    entry_price: fill,
                    entry_time: self.current_ts,
                });
            }
        }

        self.record_swap(
            "USD".to_string(),
            self.symbol.clone(),
            amount_usd,
            asset,
            fill,
            fee,
            slippage,
            Some(true),
            Some(TradeDirection::Long),
        );
        self.filled(req, asset, fill, amount_usd, fee, slippage)
    }

    fn close_long(&mut self, req: &OrderRequest) -> OrderResult {
        let pos = match self.position.clone() {
            Some(pos) if pos.direction == TradeDirection::Long => pos,
            _ => return self.reject(req, "no long position to sell"),
        };
        let (fill, pinned) = self.fill_price(Side::Sell, req.limit_price);
        let asset = req
            .amount_asset
            .or(req.amount_usd.map(|usd| usd / fill))
            .unwrap_or(pos.size)
            .min(pos.size);
        if asset <= 0.0 {
            return self.reject(req, "non-positive sell amount");
        }

        let proceeds = asset * fill;
        let fee = proceeds * self.fee_rate;
        let slippage = if pinned {
            0.0
        } else {
            asset * (self.current_price - fill).abs()
        };

        self.capital_usd += proceeds - fee;
        if asset >= pos.size - 1e-12 {
            self.position = None;
        } else if let Some(p) = self.position.as_mut() {
            let fraction = asset / pos.size;
            p.size -= asset;
            p.size_usd *= 1.0 - fraction;
        }

        self.record_swap(
            self.symbol.clone(),
            "USD".to_string(),
            asset,
            proceeds,
            fill,
            fee,
            slippage,
            Some(false),
            Some(TradeDirection::Long),
        );
        self.filled(req, asset, fill, proceeds, fee, slippage)
    }

    fn open_short(&mut self, req: &OrderRequest) -> OrderResult {
        let (fill, pinned) = self.fill_price(Side::Sell, req.limit_price);
        let mut notional = match req.amount_usd.or(req.amount_asset.map(|a| a * fill)) {
            Some(a) if a > 0.0 => a,
            _ => return self.reject(req, "missing or non-positive order amount"),
        };

        // cap the short notional at available margin
        if notional > self.capital_usd {
            warn!(
                requested = notional,
                reduced = self.capital_usd,
                "insufficient margin, reducing short"
            );
            notional = self.capital_usd;
        }
        if notional <= 0.0 {
            return self.reject(req, "no capital available");
        }

        let asset = notional / fill;
        let fee = notional * self.fee_rate;
        let slippage = if pinned {
            0.0
        } else {
            asset * (self.current_price - fill).abs()
        };

        // short-sale proceeds land in capital up front
        self.capital_usd += notional - fee;
        self.position = Some(PositionInfo {
            symbol: self.symbol.clone(),
            direction: TradeDirection::Short,
            size: asset,
            size_usd: notional,
            entry_price: fill,
            entry_time: self.current_ts,
        });

        self.record_swap(
            "USD".to_string(),
            self.short_asset(),
            notional,
            asset,
            fill,
            fee,
            slippage,
            Some(true),
            Some(TradeDirection::Short),
        );
        self.filled(req, asset, fill, notional, fee, slippage)
    }

    fn close_short(&mut self, req: &OrderRequest) -> OrderResult {
        let pos = match self.position.clone() {
            Some(pos) if pos.direction == TradeDirection::Short => pos,
            _ => return self.reject(req, "no short position to buy back"),
        };
        let (fill, pinned) = self.fill_price(Side::Buy, req.limit_price);
        let asset = req.amount_asset.unwrap_or(pos.size).min(pos.size);
        if asset <= 0.0 {
            return self.reject(req, "non-positive buy-back amount");
        }

        let cost = asset * fill;
        let fee = cost * self.fee_rate;
        let slippage = if pinned {
            0.0
        } else {
            asset * (fill - self.current_price).abs()
        };

        // buy-back always completes; capital may dip negative on a blowout
        self.capital_usd -= cost + fee;
        if asset >= pos.size - 1e-12 {
            self.position = None;
        } else if let Some(p) = self.position.as_mut() {
            let fraction = asset / pos.size;
            p.size -= asset;
            p.size_usd *= 1.0 - fraction;
        }

        self.record_swap(
            self.short_asset(),
            "USD".to_string(),
            asset,
            cost,
            fill,
            fee,
            slippage,
            Some(false),
            Some(TradeDirection::Short),
        );
        self.filled(req, asset, fill, cost, fee, slippage)
    }
}

#[async_trait]
impl ExecutorPort for SimulatedExecutor {
    async fn place_order(&mut self, req: OrderRequest) -> OrderResult {
        if req.order_type != OrderType::Market {
            return self.reject(&req, "only market orders are supported in backtests");
        }
        if self.current_price <= 0.0 {
            return self.reject(&req, "no mark price set");
        }

        let holding = self.position.as_ref().map(|p| p.direction);
        match (req.side, holding) {
            (Side::Sell, Some(TradeDirection::Long)) => self.close_long(&req),
            (Side::Buy, Some(TradeDirection::Short)) => self.close_short(&req),
            // buy with no position opens a long; buy on top of a long adds
            (Side::Buy, None) | (Side::Buy, Some(TradeDirection::Long)) => self.open_long(&req),
            (Side::Sell, None) => {
                if req.trade_direction == Some(TradeDirection::Short) {
                    self.open_short(&req)
                } else {
                    self.reject(&req, "sell without a position")
                }
            }
            (Side::Sell, Some(TradeDirection::Short)) => {
                self.reject(&req, "adding to an open short is not supported")
            }
        }
    }

    async fn get_position(&self, symbol: &str) -> Option<PositionInfo> {
        self.position
            .as_ref()
            .filter(|p| p.symbol == symbol)
            .cloned()
    }

    async fn get_current_price(&self, _symbol: &str) -> f64 {
        self.current_price
    }

    async fn get_balance(&self) -> f64 {
        self.mark_to_market()
    }

    async fn cancel_order(&mut self, _order_id: u64) -> bool {
        // market orders fill immediately; nothing to cancel
        false
    }

    async fn get_open_orders(&self, _symbol: Option<&str>) -> Vec<OrderResult> {
        Vec::new()
    }

    fn set_current_bar(&mut self, bar_index: usize, timestamp: i64) {
        self.current_bar = bar_index;
        self.current_ts = timestamp;
    }

    fn set_current_price(&mut self, price: f64) {
        self.current_price = price;
    }

    fn drain_swaps(&mut self) -> Vec<SwapEvent> {
        std::mem::take(&mut self.pending_swaps)
    }
}
