//! Pure subscription planning: diff the desired set against the active maps
//! and produce an ordered list of provider actions. No I/O here; the
//! orchestrator executes the plan with per-call timeouts and commits state
//! afterwards.

use std::collections::{BTreeMap, HashMap};

use tickvault_types::{Channel, Symbol, SymbolSpec};

/// Sentinel id recorded when a subscribe was requested but failed; retried on
/// the next apply.
pub(crate) const FAILED_SENTINEL: i64 = -1;

/// The three per-channel id maps the orchestrator owns.
#[derive(Debug, Default, Clone)]
pub(crate) struct ActiveMaps {
    pub trades: HashMap<Symbol, i64>,
    pub depth: HashMap<Symbol, i64>,
    pub option_trades: HashMap<Symbol, i64>,
}

impl ActiveMaps {
    pub(crate) fn map(&self, channel: Channel) -> &HashMap<Symbol, i64> {
        match channel {
            Channel::Trades => &self.trades,
            Channel::Depth => &self.depth,
            Channel::OptionTrades => &self.option_trades,
        }
    }

    pub(crate) fn map_mut(&mut self, channel: Channel) -> &mut HashMap<Symbol, i64> {
        match channel {
            Channel::Trades => &mut self.trades,
            Channel::Depth => &mut self.depth,
            Channel::OptionTrades => &mut self.option_trades,
        }
    }

    /// Every (channel, symbol, id) row, for teardown and persistence.
    pub(crate) fn rows(&self) -> Vec<(Channel, Symbol, i64)> {
        let mut out = Vec::new();
        for channel in [Channel::Trades, Channel::Depth, Channel::OptionTrades] {
            for (sym, id) in self.map(channel) {
                out.push((channel, sym.clone(), *id));
            }
        }
        out
    }
}

/// One provider action; unsubscribes always precede subscribes in a plan.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PlanStep {
    /// Drop the row; call the provider only when `id >= 1`.
    Unsubscribe {
        channel: Channel,
        symbol: Symbol,
        id: i64,
    },
    /// Request a new subscription for the spec on the channel.
    Subscribe {
        channel: Channel,
        spec: SymbolSpec,
    },
}

/// Which channels a spec wants live.
fn wanted(spec: &SymbolSpec) -> [(Channel, bool); 3] {
    if spec.is_option() {
        // Options route through the option-trades channel only, never depth.
        [
            (Channel::Trades, false),
            (Channel::Depth, false),
            (Channel::OptionTrades, spec.subscribe_trades),
        ]
    } else {
        [
            (Channel::Trades, spec.subscribe_trades),
            (Channel::Depth, spec.subscribe_depth && spec.depth_levels > 0),
            (Channel::OptionTrades, false),
        ]
    }
}

/// Fields that identify the instrument to the provider; a change here means
/// every live channel must be torn down and re-established.
fn routing_changed(prev: &SymbolSpec, cur: &SymbolSpec) -> bool {
    prev.exchange != cur.exchange
        || prev.local_symbol != cur.local_symbol
        || prev.primary_exchange != cur.primary_exchange
        || prev.option != cur.option
}

/// Whether a desired change requires unsubscribe + resubscribe on this
/// channel. The fixed field list is: exchange, local symbol, primary
/// exchange, option terms (all channels), plus depth levels (depth only).
/// The subscribe flags themselves are handled by the want/have diff, so an
/// unchanged trades subscription survives a depth-levels change.
pub(crate) fn channel_changed(prev: &SymbolSpec, cur: &SymbolSpec, channel: Channel) -> bool {
    routing_changed(prev, cur)
        || (channel == Channel::Depth && prev.depth_levels != cur.depth_levels)
}

/// Diff desired against previous + active and emit the action list.
pub(crate) fn build_plan(
    prev: &BTreeMap<Symbol, SymbolSpec>,
    desired: &BTreeMap<Symbol, SymbolSpec>,
    active: &ActiveMaps,
) -> Vec<PlanStep> {
    let mut unsubscribes = Vec::new();
    let mut subscribes = Vec::new();

    // Removals: anything live for a symbol that is no longer desired.
    for (channel, symbol, id) in active.rows() {
        if !desired.contains_key(&symbol) {
            unsubscribes.push(PlanStep::Unsubscribe {
                channel,
                symbol,
                id,
            });
        }
    }

    for (symbol, spec) in desired {
        for (channel, want) in wanted(spec) {
            let changed = prev
                .get(symbol)
                .is_some_and(|p| channel_changed(p, spec, channel));
            let current = active.map(channel).get(symbol).copied();
            match (want, current) {
                (true, None) => subscribes.push(PlanStep::Subscribe {
                    channel,
                    spec: spec.clone(),
                }),
                (true, Some(id)) if id == FAILED_SENTINEL => {
                    // Retry a previously failed subscribe.
                    subscribes.push(PlanStep::Subscribe {
                        channel,
                        spec: spec.clone(),
                    });
                }
                (true, Some(id)) => {
                    if changed {
                        unsubscribes.push(PlanStep::Unsubscribe {
                            channel,
                            symbol: symbol.clone(),
                            id,
                        });
                        subscribes.push(PlanStep::Subscribe {
                            channel,
                            spec: spec.clone(),
                        });
                    }
                }
                (false, Some(id)) => unsubscribes.push(PlanStep::Unsubscribe {
                    channel,
                    symbol: symbol.clone(),
                    id,
                }),
                (false, None) => {}
            }
        }
    }

    unsubscribes.extend(subscribes);
    unsubscribes
}
