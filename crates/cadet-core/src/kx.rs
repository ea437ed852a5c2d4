//! Tunnel key exchange
//!
//! Every peer announces one signed ephemeral X25519 key, replaced every
//! rekey period. The session keys of a tunnel come from our ephemeral and
//! the peer's: `e_key` encrypts what we send, `d_key` decrypts what we
//! receive. A KX carries our announcement and, once we have keys, a ping
//! (the peer's identity and a nonce, encrypted). The peer answers a ping
//! with KX_AUTH, returning the nonce encrypted under its keys; a matching
//! answer proves both sides derived the same keys.
//!
//! While a key change is unconfirmed the previous keys stay around in the
//! KX context: we keep encrypting with the old key for a while and try the
//! old keys when decryption with the newest fails. After a confirmation the
//! context is dropped with a delay, to absorb traffic still in flight.

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use cadet_crypto::{
    authenticate, decrypt, encrypt, verify_authentication, EphemeralKeyPair, EphemeralPublicKey,
    Identity, PeerIdentity, SessionKey,
};
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::config::CoreConfig;
use crate::connection::ConnectionId;
use crate::core::{Core, TimerEvent};
use crate::error::{CoreError, CoreResult};
use crate::message::{
    decode_ping, encode_ping, EncryptedBlob, Message, SignedEphemeral, TunnelEncrypted, TunnelKx,
    TunnelKxAuth, KX_FLAG_FORCE_REPLY, SIGNATURE_PURPOSE_KX,
};
use crate::timer::TimerId;

/// Upper bound of the KX retry period
pub const MAX_KX_RETRY: Duration = Duration::from_secs(5);

/// How long an unconfirmed key change keeps us on the old encryption key
pub const OLD_KEY_USE_TIME: Duration = Duration::from_secs(60);

/// Upper bound of the delay before old keys are forgotten
pub const MAX_KX_FINISH_DELAY: Duration = Duration::from_secs(60);

/// Spread of the per-tunnel rekey after a new ephemeral key, per tunnel
const REKEY_SPREAD: Duration = Duration::from_millis(100);

/// Validity added to an announcement on top of the rekey period
const ANNOUNCEMENT_SLACK: Duration = Duration::from_secs(60);

/// Encryption state of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionState {
    /// No KX sent or received
    Uninitialized,
    /// Our KX was sent, nothing received yet
    KxSent,
    /// Keys derived, our ping is unanswered
    KxPing,
    /// Keys confirmed
    Ok,
    /// Confirmed keys in use, new ones being confirmed
    Rekey,
}

impl EncryptionState {
    /// Payload may be encrypted and sent
    pub fn is_sendable(self) -> bool {
        matches!(self, Self::Ok | Self::Rekey)
    }

    fn wire_status(self) -> u32 {
        match self {
            Self::Uninitialized => 0,
            Self::KxSent => 1,
            Self::KxPing => 2,
            Self::Ok => 3,
            Self::Rekey => 4,
        }
    }
}

fn wall_clock_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Our current ephemeral key and its signed announcement
pub(crate) struct GlobalKx {
    keypair: EphemeralKeyPair,
    announcement: SignedEphemeral,
    /// Bumped on every new ephemeral key
    generation: u64,
    rekey_timer: Option<TimerId>,
}

impl GlobalKx {
    pub(crate) fn new(identity: &Identity, config: &CoreConfig) -> CoreResult<Self> {
        let keypair = EphemeralKeyPair::generate();
        let announcement = Self::announce(identity, &keypair, config.rekey_period);
        Ok(Self {
            keypair,
            announcement,
            generation: 0,
            rekey_timer: None,
        })
    }

    fn announce(identity: &Identity, keypair: &EphemeralKeyPair, rekey_period: Duration) -> SignedEphemeral {
        let created = wall_clock_micros();
        let expires = created + (rekey_period + ANNOUNCEMENT_SLACK).as_micros() as u64;
        let key = keypair.public();
        let origin = identity.peer_id();
        let signed = SignedEphemeral::signed_bytes(SIGNATURE_PURPOSE_KX, created, expires, &key, &origin);
        SignedEphemeral {
            purpose: SIGNATURE_PURPOSE_KX,
            created,
            expires,
            key,
            origin,
            signature: identity.sign(&signed),
        }
    }

    /// Number of ephemeral keys replaced so far
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

/// Keys of one generation
#[derive(Clone)]
pub(crate) struct SessionKeys {
    e_key: SessionKey,
    d_key: SessionKey,
    /// The peer proved it derived the same keys
    confirmed: bool,
}

impl SessionKeys {
    fn derive(
        ours: &EphemeralKeyPair,
        theirs: &EphemeralPublicKey,
        me: &PeerIdentity,
        peer: &PeerIdentity,
    ) -> CoreResult<Self> {
        let shared = ours.diffie_hellman(theirs);
        Ok(Self {
            e_key: shared.derive_session_key(me, peer)?,
            d_key: shared.derive_session_key(peer, me)?,
            confirmed: false,
        })
    }
}

/// State of a key change in progress
pub(crate) struct KxContext {
    challenge: u32,
    /// Previous generations, newest first
    old_keys: VecDeque<SessionKeys>,
    started: Instant,
    finish_timer: Option<TimerId>,
}

/// Crypto state of one tunnel
pub(crate) struct TunnelCrypto {
    pub(crate) estate: EncryptionState,
    peer_ephemeral: Option<EphemeralPublicKey>,
    keys: Option<SessionKeys>,
    /// Generation of our ephemeral key the keys were derived with
    derived_generation: u64,
    kx_ctx: Option<KxContext>,
    /// Pending rekey or KX retry
    pub(crate) rekey_timer: Option<TimerId>,
}

impl TunnelCrypto {
    pub(crate) fn new() -> Self {
        Self {
            estate: EncryptionState::Uninitialized,
            peer_ephemeral: None,
            keys: None,
            derived_generation: 0,
            kx_ctx: None,
            rekey_timer: None,
        }
    }

    pub(crate) fn has_keys(&self) -> bool {
        self.keys.is_some()
    }

    /// Keys derived from an ephemeral key we no longer use
    pub(crate) fn is_stale(&self, generation: u64) -> bool {
        self.has_keys() && self.derived_generation != generation
    }

    pub(crate) fn kx_in_progress(&self) -> bool {
        self.kx_ctx.is_some()
    }

    /// Timers owned by the crypto state, for teardown
    pub(crate) fn take_timers(&mut self) -> Vec<TimerId> {
        let finish = self.kx_ctx.as_mut().and_then(|ctx| ctx.finish_timer.take());
        self.rekey_timer.take().into_iter().chain(finish).collect()
    }

    /// Start a key change unless one is running; returns the finish timer
    /// to cancel
    fn begin_kx(&mut self, challenge: u32, now: Instant) -> Option<TimerId> {
        match self.kx_ctx.as_mut() {
            Some(ctx) => {
                ctx.started = now;
                ctx.finish_timer.take()
            }
            None => {
                self.kx_ctx = Some(KxContext {
                    challenge,
                    old_keys: VecDeque::new(),
                    started: now,
                    finish_timer: None,
                });
                None
            }
        }
    }

    /// Move the current keys into the KX context
    fn stash_keys(&mut self, generations: usize) {
        let Some(ctx) = self.kx_ctx.as_mut() else {
            return;
        };
        let Some(keys) = self.keys.take() else {
            return;
        };
        ctx.old_keys.push_front(keys);
        ctx.old_keys.truncate(generations);
    }

    /// Key for outgoing traffic
    ///
    /// An unconfirmed key change keeps us on the newest confirmed previous
    /// key, for at most [`OLD_KEY_USE_TIME`].
    fn encryption_key(&self, now: Instant) -> Option<&SessionKey> {
        if let Some(ctx) = &self.kx_ctx {
            if ctx.finish_timer.is_none() && now.duration_since(ctx.started) < OLD_KEY_USE_TIME {
                if let Some(old) = ctx.old_keys.iter().find(|k| k.confirmed) {
                    return Some(&old.e_key);
                }
            }
        }
        self.keys.as_ref().map(|k| &k.e_key)
    }

    /// Decryption candidates, newest first
    fn decryption_keys(&self) -> impl Iterator<Item = &SessionKey> + '_ {
        let old = self
            .kx_ctx
            .iter()
            .flat_map(|ctx| ctx.old_keys.iter().map(|k| &k.d_key));
        self.keys.iter().map(|k| &k.d_key).chain(old)
    }

    /// Authenticate and decrypt with the first key whose code matches
    fn open(&self, iv: u32, ciphertext: &[u8], hmac: &[u8; 32]) -> Option<Vec<u8>> {
        self.decryption_keys()
            .find(|key| verify_authentication(key, iv, ciphertext, hmac).is_ok())
            .and_then(|key| decrypt(key, iv, ciphertext).ok())
    }

    /// Decrypt a ping or pong blob with any known key
    fn open_blob(&self, blob: &EncryptedBlob) -> Option<Vec<u8>> {
        self.decryption_keys()
            .find_map(|key| decrypt(key, blob.iv, &blob.ciphertext).ok())
    }
}

impl Core {
    pub(crate) fn schedule_global_rekey(&mut self) {
        let period = self.config.rekey_period;
        let now = self.now;
        self.kx.rekey_timer = Some(self.timers.schedule(now, period, TimerEvent::GlobalRekey));
    }

    /// Replace our ephemeral key and rekey every tunnel, spread out in time
    pub(crate) fn global_rekey(&mut self) {
        self.kx.rekey_timer = None;
        self.kx.keypair = EphemeralKeyPair::generate();
        self.kx.announcement = GlobalKx::announce(&self.identity, &self.kx.keypair, self.config.rekey_period);
        self.kx.generation += 1;
        debug!("New ephemeral key, generation {}", self.kx.generation);
        self.stats.bump("# global rekeys");

        let peers: Vec<PeerIdentity> = self.tunnels.keys().copied().collect();
        let spread = REKEY_SPREAD * peers.len().max(1) as u32;
        let now = self.now;
        for peer in peers {
            let delay = spread.mul_f64(self.rng.gen::<f64>());
            let Some(tunnel) = self.tunnels.get_mut(&peer) else {
                continue;
            };
            if let Some(timer) = tunnel.crypto.rekey_timer.take() {
                self.timers.cancel(timer);
            }
            tunnel.crypto.rekey_timer = Some(self.timers.schedule(now, delay, TimerEvent::TunnelRekey(peer)));
        }
        self.schedule_global_rekey();
    }

    fn kx_retry_delay(&self) -> Duration {
        (self.config.rekey_period / 16).min(MAX_KX_RETRY)
    }

    fn ensure_kx_retry(&mut self, peer: PeerIdentity) {
        let delay = self.kx_retry_delay();
        let now = self.now;
        if let Some(tunnel) = self.tunnels.get_mut(&peer) {
            if tunnel.crypto.rekey_timer.is_none() {
                tunnel.crypto.rekey_timer = Some(self.timers.schedule(now, delay, TimerEvent::TunnelRekey(peer)));
            }
        }
    }

    fn set_estate(&mut self, peer: PeerIdentity, estate: EncryptionState) {
        if let Some(tunnel) = self.tunnels.get_mut(&peer) {
            if tunnel.crypto.estate != estate {
                debug!("Tunnel {:?} estate: {:?} -> {:?}", peer, tunnel.crypto.estate, estate);
                tunnel.crypto.estate = estate;
            }
        }
    }

    /// Start a key change on a tunnel and derive keys from our current
    /// ephemeral key if they are older
    fn rederive_keys(&mut self, peer: PeerIdentity) -> CoreResult<()> {
        let challenge = self.rng.gen::<u32>();
        let generations = self.config.old_key_generations;
        let generation = self.kx.generation;
        let now = self.now;
        let me = self.me;
        let Some(tunnel) = self.tunnels.get_mut(&peer) else {
            return Err(CoreError::NoTunnel(peer));
        };
        let crypto = &mut tunnel.crypto;
        if let Some(timer) = crypto.begin_kx(challenge, now) {
            self.timers.cancel(timer);
        }
        if let Some(theirs) = crypto.peer_ephemeral {
            if !crypto.has_keys() || crypto.derived_generation != generation {
                crypto.stash_keys(generations);
                crypto.keys = Some(SessionKeys::derive(&self.kx.keypair, &theirs, &me, &peer)?);
                crypto.derived_generation = generation;
            }
        }
        Ok(())
    }

    /// Send (or resend) our KX on a tunnel
    pub(crate) fn tunnel_rekey(&mut self, peer: PeerIdentity) {
        let Some(tunnel) = self.tunnels.get_mut(&peer) else {
            return;
        };
        if let Some(timer) = tunnel.crypto.rekey_timer.take() {
            self.timers.cancel(timer);
        }
        if self.tunnel_ready_connection(peer).is_none() {
            trace!("No ready connection to {:?}, KX waits", peer);
            return;
        }
        if let Err(e) = self.rederive_keys(peer) {
            warn!("Cannot derive keys for {:?}: {}", peer, e);
            return;
        }
        let Some(estate) = self.tunnels.get(&peer).map(|t| t.crypto.estate) else {
            return;
        };
        match estate {
            EncryptionState::Uninitialized => self.set_estate(peer, EncryptionState::KxSent),
            EncryptionState::Ok => self.set_estate(peer, EncryptionState::Rekey),
            _ => {}
        }
        let has_keys = self.tunnels.get(&peer).map_or(false, |t| t.crypto.has_keys());
        self.send_kx(peer, has_keys, estate == EncryptionState::Uninitialized);
        self.ensure_kx_retry(peer);
    }

    fn build_kx(&mut self, peer: PeerIdentity, cid: ConnectionId, with_ping: bool, force_reply: bool) -> Option<TunnelKx> {
        let iv = self.rng.gen::<u32>();
        let tunnel = self.tunnels.get(&peer)?;
        let ping = if with_ping {
            let ctx = tunnel.crypto.kx_ctx.as_ref();
            let keys = tunnel.crypto.keys.as_ref();
            match (ctx, keys) {
                (Some(ctx), Some(keys)) => {
                    let plaintext = encode_ping(&peer, ctx.challenge);
                    match encrypt(&keys.e_key, iv, &plaintext) {
                        Ok(ciphertext) => Some(EncryptedBlob {
                            iv,
                            ciphertext: Bytes::from(ciphertext),
                        }),
                        Err(e) => {
                            warn!("Cannot encrypt ping: {}", e);
                            None
                        }
                    }
                }
                _ => None,
            }
        } else {
            None
        };
        Some(TunnelKx {
            cid,
            flags: if force_reply { KX_FLAG_FORCE_REPLY } else { 0 },
            sender_status: tunnel.crypto.estate.wire_status(),
            ephemeral: self.kx.announcement.clone(),
            ping,
        })
    }

    /// Send our KX on the best ready connection
    pub(crate) fn send_kx(&mut self, peer: PeerIdentity, with_ping: bool, force_reply: bool) -> bool {
        let Some(cid) = self.tunnel_ready_connection(peer) else {
            trace!("No ready connection to {:?} for KX", peer);
            return false;
        };
        let Some(kx) = self.build_kx(peer, cid, with_ping, force_reply) else {
            return false;
        };
        trace!("Sending KX to {:?} (ping: {})", peer, kx.ping.is_some());
        self.stats.bump("# KX transmitted");
        self.connection_send(cid, Message::TunnelKx(kx), None, false)
    }

    /// Check a peer's announcement and switch to its key if it is new
    ///
    /// Returns None if the announcement is unacceptable, otherwise whether
    /// the key changed.
    fn accept_peer_ephemeral(&mut self, peer: PeerIdentity, announcement: &SignedEphemeral) -> Option<bool> {
        if announcement.origin != peer || announcement.purpose != SIGNATURE_PURPOSE_KX {
            warn!("KX on tunnel {:?} announces a key for {:?}", peer, announcement.origin);
            self.stats.bump("# KX with wrong origin");
            return None;
        }
        let signed = SignedEphemeral::signed_bytes(
            announcement.purpose,
            announcement.created,
            announcement.expires,
            &announcement.key,
            &announcement.origin,
        );
        if peer.verify(&signed, &announcement.signature).is_err() {
            warn!("KX from {:?} with invalid signature", peer);
            self.stats.bump("# KX with bad signature");
            return None;
        }
        if announcement.expires < wall_clock_micros() {
            warn!("KX from {:?} with expired key", peer);
            self.stats.bump("# KX with expired key");
            return None;
        }
        let tunnel = self.tunnels.get_mut(&peer)?;
        if tunnel.crypto.peer_ephemeral == Some(announcement.key) {
            return Some(false);
        }
        debug!("Tunnel {:?}: new peer ephemeral key", peer);
        tunnel.crypto.peer_ephemeral = Some(announcement.key);
        // Force a fresh derivation even within the same local generation
        tunnel.crypto.derived_generation = u64::MAX;
        if let Err(e) = self.rederive_keys(peer) {
            warn!("Cannot derive keys for {:?}: {}", peer, e);
            return None;
        }
        Some(true)
    }

    /// TUNNEL_KX on a local connection
    pub(crate) fn handle_kx(&mut self, cid: ConnectionId, kx: TunnelKx) {
        let Some(peer) = self.connections.get(&cid).map(|c| c.peer) else {
            return;
        };
        if !self.tunnels.contains_key(&peer) {
            return;
        }
        self.stats.bump("# KX received");
        let Some(changed) = self.accept_peer_ephemeral(peer, &kx.ephemeral) else {
            return;
        };
        let Some(estate) = self.tunnels.get(&peer).map(|t| t.crypto.estate) else {
            return;
        };
        trace!("KX from {:?} (changed: {}, estate: {:?})", peer, changed, estate);
        match estate {
            EncryptionState::Uninitialized | EncryptionState::KxSent => {
                self.set_estate(peer, EncryptionState::KxPing);
                self.send_kx(peer, true, false);
                self.ensure_kx_retry(peer);
            }
            EncryptionState::Ok if changed => {
                self.set_estate(peer, EncryptionState::Rekey);
                self.send_kx(peer, true, false);
                self.ensure_kx_retry(peer);
            }
            EncryptionState::KxPing | EncryptionState::Rekey if changed => {
                self.send_kx(peer, true, false);
                self.ensure_kx_retry(peer);
            }
            _ => {}
        }

        if let Some(ping) = kx.ping {
            self.answer_ping(peer, &ping);
        } else if kx.force_reply() && estate == EncryptionState::Ok && !changed {
            debug!("{:?} asked for our KX", peer);
            self.send_kx(peer, false, false);
        }
    }

    fn answer_ping(&mut self, peer: PeerIdentity, ping: &EncryptedBlob) {
        let me = self.me;
        let decoded = self
            .tunnels
            .get(&peer)
            .and_then(|t| t.crypto.open_blob(ping))
            .and_then(|plaintext| decode_ping(&plaintext).ok());
        let nonce = match decoded {
            Some((target, nonce)) if target == me => nonce,
            _ => {
                debug!("Undecryptable or misdirected ping from {:?}", peer);
                self.stats.bump("# malformed PINGs");
                self.send_kx(peer, true, false);
                self.ensure_kx_retry(peer);
                return;
            }
        };

        let Some(cid) = self.tunnel_ready_connection(peer) else {
            return;
        };
        let Some(kx) = self.build_kx(peer, cid, false, false) else {
            return;
        };
        let iv = self.rng.gen::<u32>();
        let Some(keys) = self.tunnels.get(&peer).and_then(|t| t.crypto.keys.as_ref()) else {
            return;
        };
        let sealed = encrypt(&keys.e_key, iv, &nonce.to_be_bytes())
            .and_then(|ciphertext| authenticate(&keys.e_key, iv, &ciphertext).map(|auth| (ciphertext, auth)));
        let (ciphertext, auth) = match sealed {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!("Cannot encrypt pong: {}", e);
                return;
            }
        };
        let reply = TunnelKxAuth {
            kx,
            pong: EncryptedBlob {
                iv,
                ciphertext: Bytes::from(ciphertext),
            },
            auth,
        };
        trace!("Answering ping from {:?}", peer);
        self.stats.bump("# KX_AUTH transmitted");
        self.connection_send(cid, Message::TunnelKxAuth(reply), None, false);
    }

    /// TUNNEL_KX_AUTH on a local connection
    pub(crate) fn handle_kx_auth(&mut self, cid: ConnectionId, auth: TunnelKxAuth) {
        let Some(peer) = self.connections.get(&cid).map(|c| c.peer) else {
            return;
        };
        if !self.tunnels.contains_key(&peer) {
            return;
        }
        self.stats.bump("# KX_AUTH received");
        if self.accept_peer_ephemeral(peer, &auth.kx.ephemeral).is_none() {
            return;
        }
        let Some(tunnel) = self.tunnels.get(&peer) else {
            return;
        };
        let crypto = &tunnel.crypto;
        let (Some(_), Some(ctx), Some(keys)) = (crypto.rekey_timer, crypto.kx_ctx.as_ref(), crypto.keys.as_ref()) else {
            trace!("KX_AUTH from {:?} without a KX in progress", peer);
            self.stats.bump("# duplicate PONG");
            return;
        };
        let challenge = ctx.challenge;
        let pong = &auth.pong;
        let matches = verify_authentication(&keys.d_key, pong.iv, &pong.ciphertext, &auth.auth)
            .and_then(|_| decrypt(&keys.d_key, pong.iv, &pong.ciphertext))
            .map(|nonce| nonce == challenge.to_be_bytes())
            .unwrap_or(false);
        if !matches {
            debug!("KX_AUTH from {:?} does not answer our challenge", peer);
            self.stats.bump("# KX_AUTH mismatch");
            self.send_kx(peer, true, false);
            return;
        }

        let delay = (self.config.rekey_period / 4).min(MAX_KX_FINISH_DELAY);
        let now = self.now;
        let Some(tunnel) = self.tunnels.get_mut(&peer) else {
            return;
        };
        if let Some(timer) = tunnel.crypto.rekey_timer.take() {
            self.timers.cancel(timer);
        }
        if let Some(keys) = tunnel.crypto.keys.as_mut() {
            keys.confirmed = true;
        }
        if let Some(ctx) = tunnel.crypto.kx_ctx.as_mut() {
            if let Some(timer) = ctx.finish_timer.take() {
                self.timers.cancel(timer);
            }
            ctx.finish_timer = Some(self.timers.schedule(now, delay, TimerEvent::KxFinish(peer)));
        }
        self.set_estate(peer, EncryptionState::Ok);
        self.tunnel_send_queued(peer);
    }

    /// Old keys are no longer needed
    pub(crate) fn finish_kx(&mut self, peer: PeerIdentity) {
        if let Some(tunnel) = self.tunnels.get_mut(&peer) {
            if let Some(ctx) = tunnel.crypto.kx_ctx.take() {
                trace!("Tunnel {:?} dropped {} old key generations", peer, ctx.old_keys.len());
            }
        }
    }

    /// Encrypt a payload for `peer`
    pub(crate) fn tunnel_encrypt(&mut self, peer: PeerIdentity, cid: ConnectionId, plaintext: &[u8]) -> CoreResult<TunnelEncrypted> {
        let iv = self.rng.gen::<u32>();
        let now = self.now;
        let tunnel = self.tunnels.get(&peer).ok_or(CoreError::NoTunnel(peer))?;
        let key = tunnel
            .crypto
            .encryption_key(now)
            .ok_or_else(|| CoreError::InvalidStateTransition {
                from: format!("{:?}", tunnel.crypto.estate),
                to: "encrypt".into(),
            })?;
        let ciphertext = encrypt(key, iv, plaintext)?;
        let hmac = authenticate(key, iv, &ciphertext)?;
        Ok(TunnelEncrypted {
            cid,
            pid: 0,
            ttl: 0,
            iv,
            hmac,
            ciphertext: Bytes::from(ciphertext),
        })
    }

    /// Decrypt an encrypted payload from `peer`
    pub(crate) fn tunnel_decrypt(&mut self, peer: PeerIdentity, encrypted: &TunnelEncrypted) -> Option<Vec<u8>> {
        let tunnel = self.tunnels.get(&peer)?;
        let plaintext = tunnel
            .crypto
            .open(encrypted.iv, &encrypted.ciphertext, &encrypted.hmac);
        if plaintext.is_none() {
            self.stats.bump("# wrong HMAC");
        }
        plaintext
    }
}
