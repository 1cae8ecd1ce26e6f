mod live;
mod replay;

pub use live::run_databento_stream;
pub use replay::{load_trade_csv, parse_trades};
