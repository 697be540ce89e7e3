//! Self-operating raffle.
//!
//! Players stake into an open round. A keeper polls [`raffle::Raffle::check_upkeep`]
//! and, once the interval has passed and someone has entered, closes the round by
//! requesting one random word from an oracle. When the oracle answers, the winner
//! at `word mod players` is paid the whole pot and a new round opens.
//!
//! ## Round lifecycle
//!
//! 1. **Enter**: stakes at or above the entrance fee are recorded in order.
//! 2. **Upkeep**: the round closes and a randomness request is issued; the
//!    request id is kept as the only answer the raffle will accept.
//! 3. **Fulfill**: the oracle delivers words for that id; the pot is paid
//!    first and round bookkeeping is committed only after the transfer.

pub mod clock;
pub mod config;
pub mod deposit;
pub mod error;
pub mod events;
pub mod http;
pub mod keeper;
pub mod metrics;
pub mod oracle;
pub mod payout;
pub mod raffle;
pub mod service;
pub mod state;

pub use error::RaffleError;
pub use raffle::{Raffle, UpkeepCheck};
pub use service::RaffleService;
pub use state::{Participant, RaffleConfig, RafflePhase};
