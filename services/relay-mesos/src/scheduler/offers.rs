//! Greedy offer matching.
//!
//! Offers are consumed in the order received. Each offer takes as many
//! tasks as its resources cover before moving on, until the requested
//! magnitude is placed or the offers run out. Offers that receive no task
//! are returned as unused so they can be declined.

use relay_id::{AgentId, OfferId};

use crate::driver::ResourceOffer;
use crate::resources::Resources;

/// Tasks assigned to one offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub offer_id: OfferId,
    pub agent_id: AgentId,
    pub count: u64,
}

/// Result of matching one offer round against a demand magnitude.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfferPlan {
    pub placements: Vec<Placement>,
    pub unused: Vec<OfferId>,
}

impl OfferPlan {
    /// Total tasks placed across all offers.
    pub fn placed(&self) -> u64 {
        self.placements.iter().map(|p| p.count).sum()
    }
}

/// Places up to `magnitude` tasks of size `required` onto `offers`.
pub fn plan_round(offers: &[ResourceOffer], required: &Resources, magnitude: u64) -> OfferPlan {
    let mut plan = OfferPlan::default();
    let mut remaining = magnitude;

    for offer in offers {
        let count = if remaining == 0 {
            0
        } else {
            offer.resources.fit_count(required, remaining)
        };

        if count == 0 {
            plan.unused.push(offer.id.clone());
            continue;
        }

        remaining -= count;
        plan.placements.push(Placement {
            offer_id: offer.id.clone(),
            agent_id: offer.agent_id.clone(),
            count,
        });
    }

    plan
}
