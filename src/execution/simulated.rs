//! Simulated broker for replay and paper trading
//!
//! Fills immediately at the requested price (opens) or the last marked price
//! (closes), with optional adverse slippage. Failures can be injected to
//! exercise the engine's retry paths.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tracing::{debug, info};

use super::config::BrokerConfig;
use super::order::{Direction, Fill, LegId, OpenPosition, Order, OrderError, OrderIntent, OrderManager};
use super::position::{PositionBook, TradeRecord};

/// Most recent orders kept in the order log
const MAX_ORDER_LOG: usize = 10_000;

pub struct SimulatedBroker {
    config: BrokerConfig,
    book: PositionBook,
    clock: DateTime<Utc>,
    last_price: Option<f64>,
    orders: VecDeque<Order>,
    fail_opens: u32,
    fail_closes: u32,
    offline: bool,
}

impl SimulatedBroker {
    pub fn new(config: BrokerConfig) -> Self {
        info!(
            "Simulated broker for {} | balance ${:.2} | slippage {} pts",
            config.instrument.symbol, config.starting_balance, config.slippage_points
        );
        let book = PositionBook::new(config.instrument.clone(), config.starting_balance);
        Self {
            config,
            book,
            clock: DateTime::<Utc>::UNIX_EPOCH,
            last_price: None,
            orders: VecDeque::new(),
            fail_opens: 0,
            fail_closes: 0,
            offline: false,
        }
    }

    /// Advance the broker clock and mark price
    pub fn mark(&mut self, now: DateTime<Utc>, price: f64) {
        self.clock = now;
        self.last_price = Some(price);
    }

    /// The next `n` opens fail as unavailable
    pub fn fail_next_opens(&mut self, n: u32) {
        self.fail_opens = n;
    }

    /// The next `n` closes fail as unavailable
    pub fn fail_next_closes(&mut self, n: u32) {
        self.fail_closes = n;
    }

    /// Toggle a full outage, including position queries
    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    /// Close a leg from the broker side (stop-out, manual close)
    pub fn force_close(&mut self, leg_id: &LegId) -> Option<TradeRecord> {
        let price = self.last_price?;
        self.book.close_leg(leg_id, price, self.clock)
    }

    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    /// Order log, oldest first, capped at the most recent entries
    pub fn orders(&self) -> &VecDeque<Order> {
        &self.orders
    }

    fn record(&mut self, order: Order) {
        if self.orders.len() == MAX_ORDER_LOG {
            self.orders.pop_front();
        }
        self.orders.push_back(order);
    }

    fn slip(&self, side: Direction, price: f64, intent: OrderIntent) -> f64 {
        let slippage = self.config.instrument.points(self.config.slippage_points);
        // Buying pays up, selling gives up
        let buying = match intent {
            OrderIntent::Open => side == Direction::Long,
            OrderIntent::Close => side == Direction::Short,
        };
        if buying {
            price + slippage
        } else {
            price - slippage
        }
    }
}

impl OrderManager for SimulatedBroker {
    fn open(&mut self, side: Direction, price: f64, size: f64) -> Result<Fill, OrderError> {
        if self.offline || self.fail_opens > 0 {
            self.fail_opens = self.fail_opens.saturating_sub(1);
            self.record(Order::rejected(OrderIntent::Open, None, side, size, Some(price), self.clock));
            return Err(OrderError::Unavailable("simulated outage".to_string()));
        }
        if !(size > 0.0) || !price.is_finite() {
            self.record(Order::rejected(OrderIntent::Open, None, side, size, Some(price), self.clock));
            return Err(OrderError::Rejected(format!("invalid order {} @ {}", size, price)));
        }

        let fill = Fill {
            leg_id: LegId::new(),
            side,
            price: self.slip(side, price, OrderIntent::Open),
            size,
            filled_at: self.clock,
        };
        debug!("SIM OPEN {} {} @ {:.2} [{}]", side, size, fill.price, fill.leg_id);

        self.record(Order::filled(OrderIntent::Open, &fill, Some(price)));
        self.book.open_leg(fill.clone());
        Ok(fill)
    }

    fn close(&mut self, leg_id: LegId) -> Result<Fill, OrderError> {
        let Some(entry) = self.book.entry(&leg_id).cloned() else {
            return Err(OrderError::UnknownLeg(leg_id));
        };
        if self.offline || self.fail_closes > 0 {
            self.fail_closes = self.fail_closes.saturating_sub(1);
            self.record(Order::rejected(
                OrderIntent::Close,
                Some(leg_id),
                entry.side,
                entry.size,
                None,
                self.clock,
            ));
            return Err(OrderError::Unavailable("simulated outage".to_string()));
        }

        let market = self.last_price.unwrap_or(entry.price);
        let price = self.slip(entry.side, market, OrderIntent::Close);
        let fill = Fill {
            leg_id,
            side: entry.side,
            price,
            size: entry.size,
            filled_at: self.clock,
        };
        debug!("SIM CLOSE {} {} @ {:.2} [{}]", entry.side, entry.size, price, leg_id);

        self.record(Order::filled(OrderIntent::Close, &fill, None));
        self.book.close_leg(&leg_id, price, self.clock);
        Ok(fill)
    }

    fn open_positions(&self) -> Result<Vec<OpenPosition>, OrderError> {
        if self.offline {
            return Err(OrderError::Unavailable("simulated outage".to_string()));
        }
        Ok(self.book.open_positions())
    }
}
