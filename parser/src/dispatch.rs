//! Typed subscription registry and the packet walk.
//!
//! Handlers subscribe to (entity kind, event kind) pairs; any number of
//! handlers may share a key and they run in registration order. Dispatch is
//! strictly stream-ordered: a property change may depend on a lifecycle
//! packet processed moments earlier in the same tick, so there is no
//! reordering and no concurrency.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::packet::{
    self, EntityKind, EntitySpec, MethodCall, MethodCallKind, PropertyValue, PropertyValueKind,
    entity_specs,
};
use crate::types::{EntityId, GameClock, Version};
use crate::{Error, Result};

/// Context shared by every handler invocation.
#[derive(Debug, Clone, Copy)]
pub struct PacketContext {
    pub entity_id: EntityId,
    pub clock: GameClock,
}

pub type MethodHandler<S> = fn(&mut S, &PacketContext, &MethodCall);
pub type PropertyHandler<S> = fn(&mut S, &PacketContext, &PropertyValue);

/// Registry of method/property handlers keyed by (entity kind, event kind).
pub struct Dispatcher<S> {
    methods: HashMap<(EntityKind, MethodCallKind), Vec<MethodHandler<S>>>,
    properties: HashMap<(EntityKind, PropertyValueKind), Vec<PropertyHandler<S>>>,
    /// Invoked when the recording player's own avatar enters the world.
    player_entered: Option<fn(&mut S, EntityId)>,
    /// Invoked with every packet's clock, before the packet is dispatched.
    clock_observed: Option<fn(&mut S, GameClock)>,
}

impl<S> Default for Dispatcher<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Dispatcher<S> {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
            properties: HashMap::new(),
            player_entered: None,
            clock_observed: None,
        }
    }

    pub fn on_method(&mut self, entity: EntityKind, method: MethodCallKind, handler: MethodHandler<S>) {
        self.methods.entry((entity, method)).or_default().push(handler);
    }

    pub fn on_property(
        &mut self,
        entity: EntityKind,
        property: PropertyValueKind,
        handler: PropertyHandler<S>,
    ) {
        self.properties
            .entry((entity, property))
            .or_default()
            .push(handler);
    }

    pub fn on_player_entered(&mut self, handler: fn(&mut S, EntityId)) {
        self.player_entered = Some(handler);
    }

    pub fn on_clock(&mut self, handler: fn(&mut S, GameClock)) {
        self.clock_observed = Some(handler);
    }

    pub fn dispatch_method(
        &self,
        state: &mut S,
        entity: EntityKind,
        ctx: &PacketContext,
        call: &MethodCall,
    ) {
        use kinded::Kinded;
        if let Some(handlers) = self.methods.get(&(entity, call.kind())) {
            for handler in handlers {
                handler(state, ctx, call);
            }
        }
    }

    pub fn dispatch_property(
        &self,
        state: &mut S,
        entity: EntityKind,
        ctx: &PacketContext,
        value: &PropertyValue,
    ) {
        use kinded::Kinded;
        if let Some(handlers) = self.properties.get(&(entity, value.kind())) {
            for handler in handlers {
                handler(state, ctx, value);
            }
        }
    }
}

/// Counters for decode diagnostics.
#[derive(Debug, Default, Clone, Copy)]
pub struct DecodeStats {
    pub packets: u64,
    pub dispatched: u64,
    pub skipped: u64,
}

/// Walks the packet stream, maintains the entity table, and feeds every
/// resolvable method call / property change through the dispatcher.
///
/// Failure policy: a packet referencing an unknown or destroyed entity, an
/// out-of-table method index, or an unparseable argument blob is logged and
/// skipped. Only a framing failure, which leaves no way to resynchronize,
/// aborts the walk.
pub struct PacketDecoder<S> {
    dispatcher: Dispatcher<S>,
    specs: &'static [EntitySpec],
    version: Version,
    entities: HashMap<EntityId, EntityKind>,
    pub stats: DecodeStats,
}

impl<S> PacketDecoder<S> {
    pub fn new(version: Version, dispatcher: Dispatcher<S>) -> Result<Self> {
        let specs = entity_specs(&version)
            .ok_or_else(|| Error::UnsupportedVersion(version.to_string()))?;
        Ok(Self {
            dispatcher,
            specs,
            version,
            entities: HashMap::new(),
            stats: DecodeStats::default(),
        })
    }

    pub fn entity_kind(&self, entity_id: EntityId) -> Option<EntityKind> {
        self.entities.get(&entity_id).copied()
    }

    /// Decodes the full packet stream, dispatching into `state`.
    pub fn decode_all(&mut self, mut data: &[u8], state: &mut S) -> Result<()> {
        while !data.is_empty() {
            let (rest, raw) = packet::parse_raw_packet(data)
                .map_err(|_| Error::corrupt("packet framing"))?;
            data = rest;
            self.stats.packets += 1;

            if let Some(observe) = self.dispatcher.clock_observed {
                observe(state, raw.clock);
            }

            match raw.kind {
                packet::PACKET_BASE_PLAYER_CREATE => self.handle_player_create(raw.payload, state),
                packet::PACKET_ENTITY_CREATE => self.handle_entity_create(raw.payload),
                packet::PACKET_ENTITY_LEAVE => self.handle_entity_leave(raw.payload),
                packet::PACKET_ENTITY_METHOD => {
                    self.handle_entity_method(raw.payload, raw.clock, state)
                }
                packet::PACKET_ENTITY_PROPERTY => {
                    self.handle_entity_property(raw.payload, raw.clock, state)
                }
                other => {
                    trace!(kind = other, "ignoring packet kind");
                }
            }
        }
        Ok(())
    }

    fn handle_player_create(&mut self, payload: &[u8], state: &mut S) {
        let Ok((_, entity_id)) = packet::parse_entity_id(payload) else {
            warn!("malformed player create packet");
            self.stats.skipped += 1;
            return;
        };
        self.entities.insert(entity_id, EntityKind::Avatar);
        debug!(%entity_id, "recording player entered the world");
        if let Some(entered) = self.dispatcher.player_entered {
            entered(state, entity_id);
        }
    }

    fn handle_entity_create(&mut self, payload: &[u8]) {
        let Ok((_, body)) = packet::parse_entity_create(payload) else {
            warn!("malformed entity create packet");
            self.stats.skipped += 1;
            return;
        };
        let Some(spec) = self.specs.get(body.spec_index as usize) else {
            warn!(spec_index = body.spec_index, "entity create with unknown spec");
            self.stats.skipped += 1;
            return;
        };
        trace!(entity_id = %body.entity_id, kind = ?spec.kind, "entity created");
        self.entities.insert(body.entity_id, spec.kind);
    }

    fn handle_entity_leave(&mut self, payload: &[u8]) {
        let Ok((_, entity_id)) = packet::parse_entity_id(payload) else {
            warn!("malformed entity leave packet");
            self.stats.skipped += 1;
            return;
        };
        trace!(%entity_id, "entity destroyed");
        self.entities.remove(&entity_id);
    }

    fn handle_entity_method(&mut self, payload: &[u8], clock: GameClock, state: &mut S) {
        let Ok((_, body)) = packet::parse_entity_event(payload) else {
            warn!("malformed entity method packet");
            self.stats.skipped += 1;
            return;
        };
        let Some(kind) = self.entities.get(&body.entity_id).copied() else {
            debug!(entity_id = %body.entity_id, "method call for unknown entity");
            self.stats.skipped += 1;
            return;
        };
        let spec = self.spec_for(kind);
        let Some(name) = spec.methods.get(body.index as usize) else {
            debug!(?kind, index = body.index, "method index outside spec table");
            self.stats.skipped += 1;
            return;
        };

        match packet::decode_method_call(kind, name, body.args, &self.version) {
            Ok(Some(call)) => {
                let ctx = PacketContext {
                    entity_id: body.entity_id,
                    clock,
                };
                self.dispatcher.dispatch_method(state, kind, &ctx, &call);
                self.stats.dispatched += 1;
            }
            Ok(None) => {
                self.stats.skipped += 1;
            }
            Err(e) => {
                warn!(method = name, error = %e, "failed to decode method arguments");
                self.stats.skipped += 1;
            }
        }
    }

    fn handle_entity_property(&mut self, payload: &[u8], clock: GameClock, state: &mut S) {
        let Ok((_, body)) = packet::parse_entity_event(payload) else {
            warn!("malformed entity property packet");
            self.stats.skipped += 1;
            return;
        };
        let Some(kind) = self.entities.get(&body.entity_id).copied() else {
            debug!(entity_id = %body.entity_id, "property change for unknown entity");
            self.stats.skipped += 1;
            return;
        };
        let spec = self.spec_for(kind);
        let Some(name) = spec.properties.get(body.index as usize) else {
            debug!(?kind, index = body.index, "property index outside spec table");
            self.stats.skipped += 1;
            return;
        };

        match packet::decode_property(kind, name, body.args) {
            Ok(Some(value)) => {
                let ctx = PacketContext {
                    entity_id: body.entity_id,
                    clock,
                };
                self.dispatcher.dispatch_property(state, kind, &ctx, &value);
                self.stats.dispatched += 1;
            }
            Ok(None) => {
                self.stats.skipped += 1;
            }
            Err(e) => {
                warn!(property = name, error = %e, "failed to decode property value");
                self.stats.skipped += 1;
            }
        }
    }

    fn spec_for(&self, kind: EntityKind) -> &'static EntitySpec {
        self.specs
            .iter()
            .find(|spec| spec.kind == kind)
            .expect("entity kind outside spec table")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        ribbons: Vec<i64>,
        healths: Vec<f32>,
        owner: Option<EntityId>,
    }

    fn on_ribbon(state: &mut Recorder, _ctx: &PacketContext, call: &MethodCall) {
        if let MethodCall::OnRibbon { ribbon_id } = call {
            state.ribbons.push(*ribbon_id);
        }
    }

    fn on_ribbon_again(state: &mut Recorder, _ctx: &PacketContext, call: &MethodCall) {
        if let MethodCall::OnRibbon { ribbon_id } = call {
            state.ribbons.push(*ribbon_id + 100);
        }
    }

    fn on_health(state: &mut Recorder, _ctx: &PacketContext, value: &PropertyValue) {
        if let PropertyValue::Health(health) = value {
            state.healths.push(*health);
        }
    }

    fn frame(kind: u32, clock: f32, payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(&kind.to_le_bytes());
        data.extend_from_slice(&clock.to_le_bytes());
        data.extend_from_slice(payload);
        data
    }

    fn method_frame(entity_id: u32, index: u32, args: &[u8], clock: f32) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&entity_id.to_le_bytes());
        payload.extend_from_slice(&index.to_le_bytes());
        payload.extend_from_slice(&(args.len() as u32).to_le_bytes());
        payload.extend_from_slice(args);
        frame(packet::PACKET_ENTITY_METHOD, clock, &payload)
    }

    fn property_frame(entity_id: u32, index: u32, args: &[u8], clock: f32) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&entity_id.to_le_bytes());
        payload.extend_from_slice(&index.to_le_bytes());
        payload.extend_from_slice(&(args.len() as u32).to_le_bytes());
        payload.extend_from_slice(args);
        frame(packet::PACKET_ENTITY_PROPERTY, clock, &payload)
    }

    fn create_frame(entity_id: u32, spec_index: u16) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&entity_id.to_le_bytes());
        payload.extend_from_slice(&spec_index.to_le_bytes());
        frame(packet::PACKET_ENTITY_CREATE, 0.0, &payload)
    }

    fn decoder() -> PacketDecoder<Recorder> {
        let mut dispatcher = Dispatcher::new();
        dispatcher.on_method(EntityKind::Avatar, MethodCallKind::OnRibbon, on_ribbon);
        dispatcher.on_method(EntityKind::Avatar, MethodCallKind::OnRibbon, on_ribbon_again);
        dispatcher.on_property(EntityKind::Vehicle, PropertyValueKind::Health, on_health);
        dispatcher.on_player_entered(|state, id| state.owner = Some(id));
        PacketDecoder::new(Version::from_client_exe("0,12,8,0"), dispatcher).unwrap()
    }

    #[test]
    fn dispatches_in_registration_order() {
        let mut stream = Vec::new();
        stream.extend(create_frame(10, 0)); // Avatar
        stream.extend(method_frame(10, 4, &7i32.to_le_bytes(), 1.0)); // onRibbon

        let mut state = Recorder::default();
        decoder().decode_all(&stream, &mut state).unwrap();
        assert_eq!(state.ribbons, vec![7, 107]);
    }

    #[test]
    fn unknown_entity_fails_soft() {
        let stream = method_frame(99, 4, &7i32.to_le_bytes(), 1.0);

        let mut state = Recorder::default();
        let mut decoder = decoder();
        decoder.decode_all(&stream, &mut state).unwrap();
        assert!(state.ribbons.is_empty());
        assert_eq!(decoder.stats.skipped, 1);
    }

    #[test]
    fn destroyed_entity_fails_soft() {
        let mut stream = Vec::new();
        stream.extend(create_frame(11, 1)); // Vehicle
        stream.extend(frame(
            packet::PACKET_ENTITY_LEAVE,
            2.0,
            &11u32.to_le_bytes(),
        ));
        stream.extend(property_frame(11, 0, &100.0f32.to_le_bytes(), 3.0));

        let mut state = Recorder::default();
        decoder().decode_all(&stream, &mut state).unwrap();
        assert!(state.healths.is_empty());
    }

    #[test]
    fn property_dispatch_and_owner_hook() {
        let mut stream = Vec::new();
        stream.extend(frame(
            packet::PACKET_BASE_PLAYER_CREATE,
            0.0,
            &5u32.to_le_bytes(),
        ));
        stream.extend(create_frame(11, 1)); // Vehicle
        stream.extend(property_frame(11, 0, &250.0f32.to_le_bytes(), 3.0));

        let mut state = Recorder::default();
        decoder().decode_all(&stream, &mut state).unwrap();
        assert_eq!(state.owner, Some(EntityId(5)));
        assert_eq!(state.healths, vec![250.0]);
    }

    #[test]
    fn old_client_version_is_rejected() {
        let result = PacketDecoder::<Recorder>::new(
            Version::from_client_exe("0,9,9,1"),
            Dispatcher::new(),
        );
        assert!(matches!(result, Err(Error::UnsupportedVersion(_))));
    }
}
