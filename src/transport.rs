use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use rand::{CryptoRng, Rng};
use tokio_util::sync::CancellationToken;

use crate::authority::{RevocationUpdate, TrustedAuthority};
use crate::codec;
use crate::config::NetworkConfig;
use crate::member::{MemberCredential, UpdateOutcome, Vehicle};
use crate::{GkdError, MemberId, Result, Scalar, G1, G2, ID_LEN};

const DATAGRAM_BUF: usize = 4096;
const ACK_BUF: usize = 256;
const EPOCH_LEN: usize = 8;

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| GkdError::Config(format!("cannot resolve {addr}")))
}

// ====================== 撤销广播报文 ======================

// [u64 LE epoch][u32 LE len][A_new][u32 LE len][x_r]
pub fn encode_update(update: &RevocationUpdate) -> Result<Vec<u8>> {
    let mut out = update.epoch.to_le_bytes().to_vec();
    out.extend(codec::encode_framed(&update.a_new)?);
    out.extend(codec::encode_framed(&update.x_r)?);
    Ok(out)
}

pub fn decode_update(datagram: &[u8], max_len: usize) -> Result<RevocationUpdate> {
    let epoch: [u8; EPOCH_LEN] = datagram
        .get(..EPOCH_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| GkdError::Decode(format!("{}-byte datagram has no epoch", datagram.len())))?;
    let mut offset = EPOCH_LEN;
    let (a_new, used) = codec::decode_framed::<G2>(&datagram[offset..], max_len)?;
    offset += used;
    let (x_r, used) = codec::decode_framed::<Scalar>(&datagram[offset..], max_len)?;
    offset += used;
    if offset != datagram.len() {
        return Err(GkdError::Decode(format!(
            "{} trailing bytes after update",
            datagram.len() - offset
        )));
    }
    Ok(RevocationUpdate {
        epoch: u64::from_le_bytes(epoch),
        a_new,
        x_r,
    })
}

// ====================== 注册（TCP） ======================
pub struct JoinServer {
    listener: TcpListener,
    config: NetworkConfig,
}

impl JoinServer {
    pub fn bind(config: &NetworkConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.join_bind).map_err(|e| {
            error!("Join listener bind on {} failed: {}", config.join_bind, e);
            e
        })?;
        listener.set_nonblocking(true)?;
        info!("Listening for registrations on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            config: config.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    // 单次注册：最多等待 wait 直到有车辆连接
    pub fn serve_one<R: Rng + CryptoRng>(
        &self,
        ta: &mut TrustedAuthority,
        rng: &mut R,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<MemberCredential> {
        let (stream, peer) = self.accept(wait, cancel)?;
        self.handle(stream, peer, ta, rng)
    }

    // 逐个处理注册请求直到取消；失败的注册只记录日志
    pub fn serve<R: Rng + CryptoRng>(
        &self,
        ta: &mut TrustedAuthority,
        rng: &mut R,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let mut served = 0;
        loop {
            match self.serve_one(ta, rng, self.config.io_timeout(), cancel) {
                Ok(_) => served += 1,
                Err(GkdError::Cancelled) => return Ok(served),
                Err(GkdError::Timeout) => continue,
                Err(e) => {
                    warn!("Registration failed: {}", e);
                    thread::sleep(self.config.poll_interval());
                }
            }
        }
    }

    fn accept(&self, wait: Duration, cancel: &CancellationToken) -> Result<(TcpStream, SocketAddr)> {
        let deadline = Instant::now() + wait;
        loop {
            if cancel.is_cancelled() {
                return Err(GkdError::Cancelled);
            }
            match self.listener.accept() {
                Ok(accepted) => return Ok(accepted),
                Err(e) if is_timeout(&e) => {
                    if Instant::now() >= deadline {
                        return Err(GkdError::Timeout);
                    }
                    thread::sleep(self.config.poll_interval());
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    fn handle<R: Rng + CryptoRng>(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        ta: &mut TrustedAuthority,
        rng: &mut R,
    ) -> Result<MemberCredential> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.config.io_timeout()))?;
        stream.set_write_timeout(Some(self.config.io_timeout()))?;

        let mut id = [0u8; ID_LEN];
        codec::read_exact(&mut stream, &mut id)?;
        let id = MemberId::new(id);
        info!("Registering vehicle {} from {}", id, peer);

        let credential = ta.join(id, rng)?;
        if let Err(e) = write_credential(&mut stream, &credential) {
            error!("Sending credential to {} failed: {}", peer, e);
            ta.cancel_join(&id);
            return Err(e);
        }
        Ok(credential)
    }
}

// x, w1, w2 then the issuance epoch
fn write_credential<W: Write>(writer: &mut W, credential: &MemberCredential) -> Result<()> {
    codec::write_framed(writer, &credential.x)?;
    codec::write_framed(writer, &credential.w1)?;
    codec::write_framed(writer, &credential.w2)?;
    codec::write_u64_framed(writer, credential.epoch)?;
    writer.flush()?;
    Ok(())
}

// 车辆端注册请求
pub fn request_join(config: &NetworkConfig, id: MemberId) -> Result<MemberCredential> {
    let addr = resolve(&config.join_addr)?;
    let mut stream = TcpStream::connect_timeout(&addr, config.io_timeout()).map_err(|e| {
        error!("Connecting to {} failed: {}", addr, e);
        e
    })?;
    stream.set_read_timeout(Some(config.io_timeout()))?;
    stream.set_write_timeout(Some(config.io_timeout()))?;
    stream.write_all(id.as_bytes())?;

    let max_len = config.max_element_len;
    let x: Scalar = codec::read_framed(&mut stream, max_len)?;
    let w1: G1 = codec::read_framed(&mut stream, max_len)?;
    let w2: G2 = codec::read_framed(&mut stream, max_len)?;
    let epoch = codec::read_u64_framed(&mut stream)?;
    debug!("Received credential for {} at epoch {}", id, epoch);
    Ok(MemberCredential { id, x, w1, w2, epoch })
}

// ====================== 密钥更新（UDP） ======================

// 单次广播，不重传；返回发送字节数
pub fn broadcast_update(config: &NetworkConfig, update: &RevocationUpdate) -> Result<usize> {
    let datagram = encode_update(update)?;
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_broadcast(true)?;
    let sent = socket
        .send_to(&datagram, &config.broadcast_addr)
        .map_err(|e| {
            error!("Broadcast to {} failed: {}", config.broadcast_addr, e);
            e
        })?;
    info!("Key update for epoch {} broadcast ({} bytes)", update.epoch, sent);
    Ok(sent)
}

pub struct UpdateListener {
    socket: UdpSocket,
    config: NetworkConfig,
}

impl UpdateListener {
    pub fn bind(config: &NetworkConfig) -> Result<Self> {
        let socket = UdpSocket::bind(&config.update_bind).map_err(|e| {
            error!("Update listener bind on {} failed: {}", config.update_bind, e);
            e
        })?;
        socket.set_read_timeout(Some(config.poll_interval()))?;
        info!("Listening for key updates on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            config: config.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    // 畸形报文记录后丢弃；截止时间在每轮循环都检查
    pub fn recv_update(&self, wait: Duration, cancel: &CancellationToken) -> Result<RevocationUpdate> {
        let deadline = Instant::now() + wait;
        let mut buf = vec![0u8; DATAGRAM_BUF];
        loop {
            if cancel.is_cancelled() {
                return Err(GkdError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(GkdError::Timeout);
            }
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => match decode_update(&buf[..len], self.config.max_element_len) {
                    Ok(update) => return Ok(update),
                    Err(e) => warn!("Discarding {}-byte datagram from {}: {}", len, from, e),
                },
                Err(e) if is_timeout(&e) => {}
                Err(e) => {
                    error!("Receiving key update failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    // 持续接收并应用更新，直到取消或本车被撤销；返回重新派生密钥的次数
    pub fn run(
        &self,
        vehicle: &mut Vehicle,
        ack_addr: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let mut rekeys = 0;
        loop {
            let update = match self.recv_update(self.config.io_timeout(), cancel) {
                Ok(update) => update,
                Err(GkdError::Timeout) => continue,
                Err(GkdError::Cancelled) => return Ok(rekeys),
                Err(e) => return Err(e),
            };
            info!("Key update received for epoch {}", update.epoch);
            match vehicle.apply_update(&update) {
                Ok(UpdateOutcome::Rekeyed(_)) => {
                    rekeys += 1;
                    if let Some(addr) = ack_addr {
                        if let Err(e) = send_ack(vehicle.id(), addr) {
                            error!("Ack for epoch {} failed: {}", update.epoch, e);
                        }
                    }
                }
                Ok(UpdateOutcome::Stale) => {}
                Ok(UpdateOutcome::Excluded) => {
                    warn!("Member {} is revoked, leaving update loop", vehicle.id());
                    return Ok(rekeys);
                }
                Err(e @ GkdError::EpochGap { .. }) => {
                    warn!("{}; member {} needs resynchronization", e, vehicle.id());
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ====================== 确认回执（UDP） ======================

// 回执内容为去掉填充的成员 id
pub fn send_ack(id: &MemberId, addr: &str) -> Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.send_to(id.trimmed(), addr)?;
    debug!("Sent ack for {} to {}", id, addr);
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    pub member: MemberId,
    pub from: SocketAddr,
    pub latency: Duration,
}

pub struct AckCollector {
    socket: UdpSocket,
}

impl AckCollector {
    pub fn bind(config: &NetworkConfig) -> Result<Self> {
        let socket = UdpSocket::bind(&config.ack_bind)?;
        socket.set_read_timeout(Some(config.poll_interval()))?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    // 超时或取消时返回已收到的部分回执
    pub fn collect(
        &self,
        expected: usize,
        since: Instant,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Ack>> {
        let deadline = Instant::now() + wait;
        let mut acks = Vec::with_capacity(expected);
        let mut buf = [0u8; ACK_BUF];
        while acks.len() < expected {
            if cancel.is_cancelled() || Instant::now() >= deadline {
                warn!("Collected {}/{} acks", acks.len(), expected);
                break;
            }
            match self.socket.recv_from(&mut buf) {
                Ok((0, from)) => debug!("Empty ack from {}", from),
                Ok((len, from)) => match MemberId::from_padded(&buf[..len]) {
                    Ok(member) => {
                        let latency = since.elapsed();
                        info!("Ack from {} after {:?}", member, latency);
                        acks.push(Ack { member, from, latency });
                    }
                    Err(e) => warn!("Discarding ack from {}: {}", from, e),
                },
                Err(e) if is_timeout(&e) => {}
                Err(e) => {
                    error!("Receiving ack failed: {}", e);
                    return Err(e.into());
                }
            }
        }
        Ok(acks)
    }
}
