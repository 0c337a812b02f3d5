// Static routing table: event kind -> exchange / queue / routing key
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EventBusError, Result};
use crate::event::EventKind;

pub const DEFAULT_EXCHANGE: &str = "microservice_exchange";

pub mod queue_names {
    pub const TRAINING_EVENTS: &str = "training_events";
    pub const NOTES_EVENTS: &str = "notes_events";
    pub const REFERENCE_EVENTS: &str = "reference_events";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub exchange: Exchange,
    /// Durable queue, named after the consuming service.
    pub queue: String,
    pub routing_key: String,
}

impl Route {
    /// Direct-exchange route whose routing key is the kind's wire name.
    pub fn direct(exchange: &str, queue: &str, kind: EventKind) -> Self {
        Self {
            exchange: Exchange {
                name: exchange.to_string(),
                kind: ExchangeKind::Direct,
            },
            queue: queue.to_string(),
            routing_key: kind.as_str().to_string(),
        }
    }
}

/// Immutable kind -> route mapping, shared read-only for the process lifetime.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: BTreeMap<EventKind, Route>,
}

impl RoutingTable {
    pub fn builder() -> RoutingTableBuilder {
        RoutingTableBuilder::default()
    }

    /// The platform taxonomy on a single direct exchange.
    pub fn standard(exchange: &str) -> Self {
        Self::standard_with(exchange, ExchangeKind::Direct)
    }

    /// The platform taxonomy on a single exchange of the given kind. Routing
    /// keys stay the kind names, so topic exchanges behave like direct ones.
    pub fn standard_with(exchange: &str, exchange_kind: ExchangeKind) -> Self {
        use queue_names::*;

        let routes = EventKind::ALL
            .iter()
            .map(|kind| {
                let queue = match kind {
                    EventKind::UserCreated | EventKind::UserUpdated | EventKind::UserDeleted => {
                        TRAINING_EVENTS
                    }
                    EventKind::TrainingCreated | EventKind::TrainingUpdated => NOTES_EVENTS,
                    EventKind::ReferenceDeleted => REFERENCE_EVENTS,
                };
                let mut route = Route::direct(exchange, queue, *kind);
                route.exchange.kind = exchange_kind;
                (*kind, route)
            })
            .collect();

        Self { routes }
    }

    /// Subset of this table for a service that only deals with `kinds`.
    pub fn restricted_to(&self, kinds: &[EventKind]) -> Self {
        let routes = self
            .routes
            .iter()
            .filter(|(kind, _)| kinds.contains(kind))
            .map(|(kind, route)| (*kind, route.clone()))
            .collect();
        Self { routes }
    }

    pub fn route(&self, kind: EventKind) -> Result<&Route> {
        self.routes.get(&kind).ok_or(EventBusError::UnknownRoute(kind))
    }

    pub fn contains(&self, kind: EventKind) -> bool {
        self.routes.contains_key(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EventKind, &Route)> {
        self.routes.iter().map(|(kind, route)| (*kind, route))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Distinct exchanges, in declaration order.
    pub fn exchanges(&self) -> Vec<Exchange> {
        let mut exchanges: Vec<Exchange> = Vec::new();
        for route in self.routes.values() {
            if !exchanges.contains(&route.exchange) {
                exchanges.push(route.exchange.clone());
            }
        }
        exchanges
    }

    /// Kinds carried by each queue.
    pub fn queues(&self) -> BTreeMap<String, Vec<EventKind>> {
        let mut queues: BTreeMap<String, Vec<EventKind>> = BTreeMap::new();
        for (kind, route) in &self.routes {
            queues.entry(route.queue.clone()).or_default().push(*kind);
        }
        queues
    }
}

#[derive(Debug, Default)]
pub struct RoutingTableBuilder {
    routes: Vec<(EventKind, Route)>,
}

impl RoutingTableBuilder {
    pub fn route(mut self, kind: EventKind, route: Route) -> Self {
        self.routes.push((kind, route));
        self
    }

    pub fn build(self) -> Result<RoutingTable> {
        let mut routes = BTreeMap::new();
        let mut exchange_kinds: HashMap<String, ExchangeKind> = HashMap::new();

        for (kind, route) in self.routes {
            if let Some(existing) = exchange_kinds.get(&route.exchange.name) {
                if *existing != route.exchange.kind {
                    return Err(EventBusError::Config(format!(
                        "exchange {} declared as both {} and {}",
                        route.exchange.name, existing, route.exchange.kind
                    )));
                }
            }
            exchange_kinds.insert(route.exchange.name.clone(), route.exchange.kind);

            if routes.insert(kind, route).is_some() {
                return Err(EventBusError::Config(format!(
                    "event kind {kind} mapped to more than one route"
                )));
            }
        }

        Ok(RoutingTable { routes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_table_covers_every_kind() {
        let table = RoutingTable::standard(DEFAULT_EXCHANGE);
        assert_eq!(table.len(), EventKind::ALL.len());

        let route = table.route(EventKind::ReferenceDeleted).unwrap();
        assert_eq!(route.queue, queue_names::REFERENCE_EVENTS);
        assert_eq!(route.routing_key, "REFERENCE_DELETED");
        assert_eq!(route.exchange.kind, ExchangeKind::Direct);
        assert_eq!(table.exchanges().len(), 1);
    }

    #[test]
    fn standard_with_applies_exchange_kind() {
        let table = RoutingTable::standard_with("bus", ExchangeKind::Topic);
        assert_eq!(
            table.exchanges(),
            vec![Exchange {
                name: "bus".to_string(),
                kind: ExchangeKind::Topic
            }]
        );
    }

    #[test]
    fn queues_group_kinds() {
        let queues = RoutingTable::standard(DEFAULT_EXCHANGE).queues();
        assert_eq!(queues[queue_names::TRAINING_EVENTS].len(), 3);
        assert_eq!(
            queues[queue_names::NOTES_EVENTS],
            vec![EventKind::TrainingCreated, EventKind::TrainingUpdated]
        );
    }

    #[test]
    fn restricted_table_reports_unknown_route() {
        let table = RoutingTable::standard(DEFAULT_EXCHANGE).restricted_to(&[EventKind::UserCreated]);
        assert!(table.contains(EventKind::UserCreated));
        assert!(matches!(
            table.route(EventKind::TrainingCreated),
            Err(EventBusError::UnknownRoute(EventKind::TrainingCreated))
        ));
    }

    #[test]
    fn builder_rejects_duplicate_kind() {
        let result = RoutingTable::builder()
            .route(EventKind::UserCreated, Route::direct("x", "a", EventKind::UserCreated))
            .route(EventKind::UserCreated, Route::direct("x", "b", EventKind::UserCreated))
            .build();
        assert!(matches!(result, Err(EventBusError::Config(_))));
    }

    #[test]
    fn builder_rejects_conflicting_exchange_kind() {
        let mut fanout = Route::direct("x", "b", EventKind::UserUpdated);
        fanout.exchange.kind = ExchangeKind::Fanout;

        let result = RoutingTable::builder()
            .route(EventKind::UserCreated, Route::direct("x", "a", EventKind::UserCreated))
            .route(EventKind::UserUpdated, fanout)
            .build();
        assert!(matches!(result, Err(EventBusError::Config(_))));
    }
}
