use solana_sdk::pubkey::Pubkey;

/// Emitted when a stake is recorded for the current round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryAccepted {
    pub player: Pubkey,
    pub amount: u64,
    pub round: u64,
}

/// Emitted when a round closes and randomness has been requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomnessRequested {
    pub request_id: u64,
    pub round: u64,
}

/// Emitted once the winner has been paid and the next round has opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinnerPicked {
    pub winner: Pubkey,
    pub amount: u64,
    pub request_id: u64,
    /// The round that was settled.
    pub round: u64,
    /// Transfer receipt returned by the payout backend.
    pub receipt: String,
}

/// Emitted when an operator abandons a stalled randomness request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecovered {
    pub request_id: u64,
    pub round: u64,
}

/// Every notification published to raffle observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaffleEvent {
    EntryAccepted(EntryAccepted),
    RandomnessRequested(RandomnessRequested),
    WinnerPicked(WinnerPicked),
    RequestRecovered(RequestRecovered),
}

impl From<EntryAccepted> for RaffleEvent {
    fn from(event: EntryAccepted) -> Self {
        RaffleEvent::EntryAccepted(event)
    }
}

impl From<RandomnessRequested> for RaffleEvent {
    fn from(event: RandomnessRequested) -> Self {
        RaffleEvent::RandomnessRequested(event)
    }
}

impl From<WinnerPicked> for RaffleEvent {
    fn from(event: WinnerPicked) -> Self {
        RaffleEvent::WinnerPicked(event)
    }
}

impl From<RequestRecovered> for RaffleEvent {
    fn from(event: RequestRecovered) -> Self {
        RaffleEvent::RequestRecovered(event)
    }
}
