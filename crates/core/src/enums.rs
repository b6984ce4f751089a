use serde::{Deserialize, Serialize};

/// Task lifecycle status. Transitions are owned exclusively by the
/// negotiation engine; see `errand-engine`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    CostReview,
    CostProposed,
    UserCounterProposed,
    DeliveryCounterProposed,
    Assigned,
    Completed,
    Cancelled,
}

impl TaskStatus {
    /// Statuses visible on the public "available work" surface.
    pub const NEGOTIABLE: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::CostProposed,
        TaskStatus::UserCounterProposed,
        TaskStatus::DeliveryCounterProposed,
    ];

    pub fn is_negotiable(self) -> bool {
        Self::NEGOTIABLE.contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::CostReview => "cost_review",
            TaskStatus::CostProposed => "cost_proposed",
            TaskStatus::UserCounterProposed => "user_counter_proposed",
            TaskStatus::DeliveryCounterProposed => "delivery_counter_proposed",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "cost_review" => Some(TaskStatus::CostReview),
            "cost_proposed" => Some(TaskStatus::CostProposed),
            "user_counter_proposed" => Some(TaskStatus::UserCounterProposed),
            "delivery_counter_proposed" => Some(TaskStatus::DeliveryCounterProposed),
            "assigned" => Some(TaskStatus::Assigned),
            "completed" => Some(TaskStatus::Completed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

/// Status of a single cost proposal row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    UserCounter,
    Accepted,
    Rejected,
}

impl ProposalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::UserCounter => "user_counter",
            ProposalStatus::Accepted => "accepted",
            ProposalStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProposalStatus::Pending),
            "user_counter" => Some(ProposalStatus::UserCounter),
            "accepted" => Some(ProposalStatus::Accepted),
            "rejected" => Some(ProposalStatus::Rejected),
            _ => None,
        }
    }
}

/// How a delivery worker answers a user counter-offer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterResponse {
    Accept,
    Reject,
    Counter,
}

impl CounterResponse {
    pub fn as_str(self) -> &'static str {
        match self {
            CounterResponse::Accept => "accept",
            CounterResponse::Reject => "reject",
            CounterResponse::Counter => "counter",
        }
    }
}

/// Which side of the negotiation performed an action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationParty {
    User,
    DeliveryMan,
}

impl NegotiationParty {
    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationParty::User => "user",
            NegotiationParty::DeliveryMan => "delivery_man",
        }
    }
}
