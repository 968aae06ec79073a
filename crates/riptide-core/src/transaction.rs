// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Transactions, action/auth dispatch and the PreExecute gate.
//!
//! Action and auth payloads are host-defined: the core routes them through
//! byte-tagged unmarshal registries ([`Parser`]) and calls back through the
//! [`Action`]/[`Auth`] traits. PreExecute classifies admission failures into
//! the retriable/fatal taxonomy the builder and processor act on.

use crate::codec::{CodecError, Reader, Writer, NETWORK_SIZE_LIMIT};
use crate::crypto::Digest;
use crate::fees::FeeManager;
use crate::host::Rules;
use crate::state::{Keys, Permissions, StateError, StateManager};
use crate::tstate::TStateView;
use crate::types::TxResult;
use ahash::AHashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub type TxId = Digest;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum PreExecuteError {
    #[error("insufficient price")]
    InsufficientPrice,
    #[error("invalid balance")]
    InvalidBalance,
    #[error("auth verification failed")]
    AuthFailed,
    #[error("auth not activated")]
    AuthNotActivated,
    #[error("action not activated")]
    ActionNotActivated,
    #[error("timestamp too early")]
    TimestampTooEarly,
    #[error("timestamp too late")]
    TimestampTooLate,
    #[error("state: {0}")]
    State(#[from] StateError),
}

impl PreExecuteError {
    /// Retriable failures return the transaction to the mempool; everything
    /// else drops it.
    pub fn is_retriable(&self) -> bool {
        matches!(self, PreExecuteError::TimestampTooEarly)
    }
}

#[derive(Debug, Error)]
pub enum ActionError {
    /// Action-level revert: the transaction is billed and recorded as
    /// unsuccessful, execution of the block continues.
    #[error("reverted: {0}")]
    Revert(String),
    /// Scope or permission violation escaping an action is a block-level
    /// fault.
    #[error("state: {0}")]
    State(#[from] StateError),
}

#[derive(Default)]
pub struct ActionOutput {
    pub output: Option<Vec<u8>>,
    pub warp_message: Option<Vec<u8>>,
}

pub trait Action: Send + Sync {
    fn kind(&self) -> u8;
    fn marshal(&self, w: &mut Writer);
    /// Every state key the action may touch, with required permission bits.
    fn state_keys(&self, sm: &dyn StateManager, actor: &[u8]) -> Keys;
    /// Worst-case unit consumption, used for fee admission.
    fn max_units(&self, rules: &dyn Rules) -> u64;
    fn execute(
        &self,
        sm: &dyn StateManager,
        tsv: &mut TStateView<'_>,
        timestamp: i64,
        actor: &[u8],
        warp_verified: bool,
    ) -> Result<ActionOutput, ActionError>;
}

pub trait Auth: Send + Sync {
    fn kind(&self) -> u8;
    fn marshal(&self, w: &mut Writer);
    /// Address charged for the transaction.
    fn actor(&self) -> Vec<u8>;
    fn verify(&self, digest: &[u8]) -> bool;
    fn state_keys(&self) -> Keys {
        Keys::new()
    }
}

pub type ActionUnmarshaler = fn(&mut Reader<'_>) -> Result<Arc<dyn Action>, CodecError>;
pub type AuthUnmarshaler = fn(&mut Reader<'_>) -> Result<Arc<dyn Auth>, CodecError>;

/// Byte-tag dispatch tables for decoding host-defined payloads.
#[derive(Default)]
pub struct Parser {
    actions: AHashMap<u8, ActionUnmarshaler>,
    auths: AHashMap<u8, AuthUnmarshaler>,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_action(&mut self, kind: u8, unmarshal: ActionUnmarshaler) {
        self.actions.insert(kind, unmarshal);
    }

    pub fn register_auth(&mut self, kind: u8, unmarshal: AuthUnmarshaler) {
        self.auths.insert(kind, unmarshal);
    }

    fn unmarshal_action(&self, r: &mut Reader<'_>) -> Result<Arc<dyn Action>, CodecError> {
        let kind = r.unpack_u8()?;
        let unmarshal = self
            .actions
            .get(&kind)
            .ok_or(CodecError::UnknownTag(kind, "action"))?;
        unmarshal(r)
    }

    fn unmarshal_auth(&self, r: &mut Reader<'_>) -> Result<Arc<dyn Auth>, CodecError> {
        let kind = r.unpack_u8()?;
        let unmarshal = self
            .auths
            .get(&kind)
            .ok_or(CodecError::UnknownTag(kind, "auth"))?;
        unmarshal(r)
    }
}

/// Cross-chain signed payload whose verification is asynchronous to
/// execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WarpMessage {
    pub source_chain_id: Digest,
    pub payload: Vec<u8>,
}

impl WarpMessage {
    pub fn marshal(&self, w: &mut Writer) {
        w.pack_fixed(self.source_chain_id.as_ref());
        w.pack_bytes(&self.payload);
    }

    pub fn unmarshal(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            source_chain_id: Digest(r.unpack_fixed()?),
            payload: r.unpack_bytes(NETWORK_SIZE_LIMIT)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Base {
    /// Expiry: the last block timestamp this transaction may execute at.
    pub timestamp: i64,
    pub chain_id: Digest,
    pub max_fee: u64,
}

impl Base {
    fn marshal(&self, w: &mut Writer) {
        w.pack_i64(self.timestamp);
        w.pack_fixed(self.chain_id.as_ref());
        w.pack_u64(self.max_fee);
    }

    fn unmarshal(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            timestamp: r.unpack_i64()?,
            chain_id: Digest(r.unpack_fixed()?),
            max_fee: r.unpack_u64()?,
        })
    }
}

#[derive(Clone)]
pub struct Transaction {
    pub base: Base,
    pub action: Arc<dyn Action>,
    pub auth: Arc<dyn Auth>,
    pub warp_message: Option<WarpMessage>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("expiry", &self.base.timestamp)
            .field("warp", &self.warp_message.is_some())
            .finish()
    }
}

impl Transaction {
    /// Signed portion: everything but the auth payload.
    pub fn digest(&self) -> Vec<u8> {
        let mut w = Writer::new(128);
        self.base.marshal(&mut w);
        w.pack_u8(self.action.kind());
        self.action.marshal(&mut w);
        match &self.warp_message {
            Some(warp) => {
                w.pack_bool(true);
                warp.marshal(&mut w);
            }
            None => w.pack_bool(false),
        }
        w.into_bytes()
    }

    pub fn marshal(&self, w: &mut Writer) {
        self.base.marshal(w);
        w.pack_u8(self.action.kind());
        self.action.marshal(w);
        match &self.warp_message {
            Some(warp) => {
                w.pack_bool(true);
                warp.marshal(w);
            }
            None => w.pack_bool(false),
        }
        w.pack_u8(self.auth.kind());
        self.auth.marshal(w);
    }

    pub fn unmarshal(r: &mut Reader<'_>, parser: &Parser) -> Result<Self, CodecError> {
        let base = Base::unmarshal(r)?;
        let action = parser.unmarshal_action(r)?;
        let warp_message = match r.unpack_bool()? {
            true => Some(WarpMessage::unmarshal(r)?),
            false => None,
        };
        let auth = parser.unmarshal_auth(r)?;
        Ok(Self {
            base,
            action,
            auth,
            warp_message,
        })
    }

    pub fn id(&self) -> TxId {
        let mut w = Writer::new(256);
        self.marshal(&mut w);
        Digest::hash_of(&w.into_bytes())
    }

    /// Declared key set: action keys, auth keys, and the actor's balance
    /// key (fees are always charged).
    pub fn state_keys(&self, sm: &dyn StateManager) -> Keys {
        let actor = self.auth.actor();
        let mut keys = self.action.state_keys(sm, &actor);
        keys.merge(self.auth.state_keys());
        keys.add(
            sm.balance_key(&actor),
            Permissions::READ | Permissions::WRITE,
        );
        keys
    }

    pub fn max_units(&self, rules: &dyn Rules) -> u64 {
        rules.base_units().saturating_add(self.action.max_units(rules))
    }

    /// Fee, timestamp, activation, balance and auth checks. Runs against the
    /// transaction's scoped view before execution.
    pub fn pre_execute(
        &self,
        fee_manager: &FeeManager,
        sm: &dyn StateManager,
        rules: &dyn Rules,
        tsv: &TStateView<'_>,
        timestamp: i64,
    ) -> Result<(), PreExecuteError> {
        if self.base.timestamp < timestamp {
            return Err(PreExecuteError::TimestampTooLate);
        }
        if self.base.timestamp > timestamp + rules.validity_window() {
            return Err(PreExecuteError::TimestampTooEarly);
        }
        if !rules.is_auth_activated(self.auth.kind(), timestamp) {
            return Err(PreExecuteError::AuthNotActivated);
        }
        if !rules.is_action_activated(self.action.kind(), timestamp) {
            return Err(PreExecuteError::ActionNotActivated);
        }

        let worst_case_fee = self
            .max_units(rules)
            .saturating_mul(fee_manager.unit_price());
        if worst_case_fee > self.base.max_fee {
            return Err(PreExecuteError::InsufficientPrice);
        }
        let balance = read_balance(tsv, &sm.balance_key(&self.auth.actor()))?;
        if balance < worst_case_fee {
            return Err(PreExecuteError::InvalidBalance);
        }

        if !self.auth.verify(&self.digest()) {
            return Err(PreExecuteError::AuthFailed);
        }
        Ok(())
    }

    /// Run the action and charge fees. Action reverts are absorbed into an
    /// unsuccessful [`TxResult`]; state violations propagate and fault the
    /// block.
    pub fn execute(
        &self,
        fee_manager: &FeeManager,
        reads: &AHashMap<Vec<u8>, u16>,
        sm: &dyn StateManager,
        rules: &dyn Rules,
        tsv: &mut TStateView<'_>,
        timestamp: i64,
        warp_verified: bool,
    ) -> Result<TxResult, StateError> {
        let actor = self.auth.actor();
        let checkpoint = tsv.op_index();
        let (success, output, warp_message) =
            match self
                .action
                .execute(sm, tsv, timestamp, &actor, warp_verified)
            {
                Ok(out) => (true, out.output, out.warp_message),
                Err(ActionError::Revert(reason)) => {
                    tsv.rollback(checkpoint);
                    (false, Some(reason.into_bytes()), None)
                }
                Err(ActionError::State(err)) => return Err(err),
            };

        // Bill what was actually touched: declared reads plus the net
        // allocate/write chunk counts of this view.
        let (allocates, writes) = tsv.key_operations();
        let touched: u64 = reads.values().map(|c| u64::from(*c)).sum::<u64>()
            + allocates.values().map(|c| u64::from(*c)).sum::<u64>()
            + writes.values().map(|c| u64::from(*c)).sum::<u64>();
        let units = rules.base_units().saturating_add(touched);
        let fee = units.saturating_mul(fee_manager.unit_price());

        let balance_key = sm.balance_key(&actor);
        let balance = read_balance(tsv, &balance_key).map_err(|_| StateError::InvalidKeyValue)?;
        // PreExecute checked the worst case and conflicting spenders are
        // serialized, so the charge cannot underflow.
        let remaining = balance.saturating_sub(fee);
        tsv.insert(&balance_key, remaining.to_le_bytes().to_vec())?;

        Ok(TxResult {
            success,
            units,
            output,
            warp_message,
        })
    }
}

fn read_balance(tsv: &TStateView<'_>, balance_key: &[u8]) -> Result<u64, PreExecuteError> {
    match tsv.get_value(balance_key) {
        Ok(raw) => {
            let bytes: [u8; 8] = raw
                .as_slice()
                .try_into()
                .map_err(|_| PreExecuteError::InvalidBalance)?;
            Ok(u64::from_le_bytes(bytes))
        }
        Err(StateError::NotFound) => Ok(0),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::state::encode_chunks;

    pub const SET_ACTION_KIND: u8 = 1;
    pub const TEST_AUTH_KIND: u8 = 1;

    /// Writes one value under one key; reverts on demand.
    pub struct SetAction {
        pub key: Vec<u8>,
        pub value: Vec<u8>,
        pub revert: bool,
    }

    impl SetAction {
        pub fn suffixed_key(&self) -> Vec<u8> {
            encode_chunks(self.key.clone(), 4)
        }
    }

    impl Action for SetAction {
        fn kind(&self) -> u8 {
            SET_ACTION_KIND
        }

        fn marshal(&self, w: &mut Writer) {
            w.pack_bytes(&self.key);
            w.pack_bytes(&self.value);
            w.pack_bool(self.revert);
        }

        fn state_keys(&self, _sm: &dyn StateManager, _actor: &[u8]) -> Keys {
            [(self.suffixed_key(), Permissions::all())]
                .into_iter()
                .collect()
        }

        fn max_units(&self, _rules: &dyn Rules) -> u64 {
            100
        }

        fn execute(
            &self,
            _sm: &dyn StateManager,
            tsv: &mut TStateView<'_>,
            _timestamp: i64,
            _actor: &[u8],
            _warp_verified: bool,
        ) -> Result<ActionOutput, ActionError> {
            tsv.insert(&self.suffixed_key(), self.value.clone())?;
            if self.revert {
                return Err(ActionError::Revert("forced revert".into()));
            }
            Ok(ActionOutput::default())
        }
    }

    fn unmarshal_set_action(r: &mut Reader<'_>) -> Result<Arc<dyn Action>, CodecError> {
        Ok(Arc::new(SetAction {
            key: r.unpack_bytes(NETWORK_SIZE_LIMIT)?,
            value: r.unpack_bytes(NETWORK_SIZE_LIMIT)?,
            revert: r.unpack_bool()?,
        }))
    }

    pub struct TestAuth {
        pub actor: Vec<u8>,
        pub valid: bool,
    }

    impl Auth for TestAuth {
        fn kind(&self) -> u8 {
            TEST_AUTH_KIND
        }

        fn marshal(&self, w: &mut Writer) {
            w.pack_bytes(&self.actor);
            w.pack_bool(self.valid);
        }

        fn actor(&self) -> Vec<u8> {
            self.actor.clone()
        }

        fn verify(&self, _digest: &[u8]) -> bool {
            self.valid
        }
    }

    fn unmarshal_test_auth(r: &mut Reader<'_>) -> Result<Arc<dyn Auth>, CodecError> {
        Ok(Arc::new(TestAuth {
            actor: r.unpack_bytes(NETWORK_SIZE_LIMIT)?,
            valid: r.unpack_bool()?,
        }))
    }

    pub fn test_parser() -> Parser {
        let mut parser = Parser::new();
        parser.register_action(SET_ACTION_KIND, unmarshal_set_action);
        parser.register_auth(TEST_AUTH_KIND, unmarshal_test_auth);
        parser
    }

    pub fn set_tx(actor: &[u8], key: &[u8], value: &[u8], expiry: i64) -> Transaction {
        Transaction {
            base: Base {
                timestamp: expiry,
                chain_id: Digest::hash_of(b"test-chain"),
                max_fee: 1_000_000,
            },
            action: Arc::new(SetAction {
                key: key.to_vec(),
                value: value.to_vec(),
                revert: false,
            }),
            auth: Arc::new(TestAuth {
                actor: actor.to_vec(),
                valid: true,
            }),
            warp_message: None,
        }
    }
}
