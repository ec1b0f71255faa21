//! 9P2000 server: request dispatch over one connection at a time.
//!
//! Requests are handled strictly in order. Each frame is read, decoded,
//! handled to completion, encoded and written before the next frame is read.
//!
//! # Protocol
//! 9P2000

use {
    crate::{
        error::Ename,
        fcall::*,
        fid::{FidTable, Handle},
        fs, io_err, res, serialize,
        session::Session,
        transport,
        utils::{self, Result},
    },
    bytes::BytesMut,
    log::{error, info, warn},
    nix::unistd::AccessFlags,
    std::{
        path::{Path, PathBuf},
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UnixListener},
        sync::Notify,
    },
};

/// Boxed input half of a transport
pub type Reader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed output half of a transport
pub type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Server settings
#[derive(Clone, Debug)]
pub struct Config {
    /// Largest frame the server accepts or sends before negotiation
    pub msize: u32,
    /// Log every request and response
    pub debug: bool,
    /// Keep serving after end of stream or a transport error, as on a device
    pub reconnect: bool,
    /// Pause after end of stream before reading again
    pub eof_delay: Duration,
    /// Pause after a transport error before reading again
    pub error_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            msize: MAXMSG,
            debug: false,
            reconnect: false,
            eof_delay: Duration::from_secs(1),
            error_delay: Duration::from_millis(100),
        }
    }
}

/// Cloneable handle that stops a running server
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Default::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once [`Shutdown::trigger`] has been called
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Exports one host directory over 9P2000
pub struct Server {
    root: PathBuf,
    config: Config,
    session: Session,
    fids: FidTable,
    reader: Option<Reader>,
    writer: Option<Writer>,
    shutdown: Shutdown,
}

impl Server {
    pub fn new(root: impl Into<PathBuf>, debug: bool) -> Server {
        Server::with_config(
            root,
            Config {
                debug,
                ..Default::default()
            },
        )
    }

    pub fn with_config(root: impl Into<PathBuf>, config: Config) -> Server {
        Server {
            root: root.into(),
            session: Session::new(config.msize),
            config,
            fids: FidTable::new(),
            reader: None,
            writer: None,
            shutdown: Shutdown::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn fids(&self) -> &FidTable {
        &self.fids
    }

    /// Attach the byte streams the next [`Server::run`] serves
    pub fn set_endpoints<R, W>(&mut self, reader: R, writer: W)
    where
        R: 'static + AsyncRead + Send + Unpin,
        W: 'static + AsyncWrite + Send + Unpin,
    {
        self.reader = Some(Box::new(reader));
        self.writer = Some(Box::new(writer));
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Serve the current endpoints until end of stream or shutdown.
    ///
    /// Every run starts un-negotiated and ends with no live fids.
    pub async fn run(&mut self) -> Result<()> {
        let (mut reader, mut writer) = match (self.reader.take(), self.writer.take()) {
            (Some(reader), Some(writer)) => (reader, writer),
            _ => return res!(io_err!(NotConnected, "No endpoints to serve")),
        };

        self.session.reset();
        self.fids.destroy_all();

        let shutdown = self.shutdown.clone();
        let result = loop {
            if shutdown.is_triggered() {
                break Ok(());
            }

            let frame = tokio::select! {
                _ = shutdown.wait() => break Ok(()),
                frame = transport::read_frame(&mut reader, self.session.msize()) => frame,
            };

            match frame {
                Ok(Some(frame)) => {
                    let Some(response) = self.handle_frame(&frame).await else {
                        continue;
                    };
                    if let Err(e) = transport::write_frame(&mut writer, &response).await {
                        error!("Failed to send response: {:?}", e);
                        if !self.config.reconnect {
                            break Err(e.into());
                        }
                        tokio::time::sleep(self.config.error_delay).await;
                    }
                }
                Ok(None) if self.config.reconnect => {
                    tokio::time::sleep(self.config.eof_delay).await;
                }
                Ok(None) => {
                    info!("End of stream");
                    break Ok(());
                }
                Err(e) => {
                    error!("Failed to read frame: {:?}", e);
                    if !self.config.reconnect {
                        break Err(e.into());
                    }
                    tokio::time::sleep(self.config.error_delay).await;
                }
            }
        };

        self.fids.destroy_all();
        result
    }

    /// Handle one complete frame, returning the encoded response if there is one
    pub async fn handle_frame(&mut self, frame: &[u8]) -> Option<BytesMut> {
        // A TVersion may shrink msize; its reply still travels under the old limit
        let limit = self.session.msize();
        let response = match serialize::decode_msg(frame) {
            Ok(msg) => {
                if self.config.debug {
                    info!("\t← {:?}", msg);
                }
                self.handle_message(&msg).await
            }
            Err(e) => {
                error!("Malformed frame: {}", e);
                Msg {
                    tag: NOTAG,
                    body: Ename::Botch.into(),
                }
            }
        };

        self.encode_response(&response, limit)
    }

    fn encode_response(&self, response: &Msg, msize: u32) -> Option<BytesMut> {
        match serialize::encode_msg(response, msize) {
            Ok(frame) => {
                if self.config.debug {
                    info!("\t→ {:?}", response);
                }
                Some(frame)
            }
            Err(e) => {
                error!("Failed to serialize response for tag {}: {:?}", response.tag, e);
                let fallback = Msg {
                    tag: response.tag,
                    body: Ename::Io.into(),
                };
                serialize::encode_msg(&fallback, msize)
                    .map_err(|e| error!("Dropping response for tag {}: {:?}", response.tag, e))
                    .ok()
            }
        }
    }

    /// Handle one decoded request without a transport
    pub async fn handle_message(&mut self, msg: &Msg) -> Msg {
        let body = self.dispatch(&msg.body).await.unwrap_or_else(|e| {
            error!("{:?}: Error: \"{}\": {:?}", MsgType::from(&msg.body), e, e);
            e.ename().into()
        });

        Msg { tag: msg.tag, body }
    }

    #[rustfmt::skip]
    async fn dispatch(&mut self, body: &FCall) -> Result<FCall> {
        use crate::FCall::*;

        match *body {
            TVersion { msize, ref version }             => self.rversion(msize, version),
            TAuth { .. }                                => res!(Ename::NoAuth),
            TAttach { fid, .. }                         => self.rattach(fid).await,
            TFlush { oldtag: _ }                        => Ok(RFlush),
            TWalk { fid, newfid, ref wnames }           => self.rwalk(fid, newfid, wnames).await,
            TOpen { fid, mode }                         => self.ropen(fid, mode).await,
            TCreate { fid, ref name, perm, mode }       => self.rcreate(fid, name, perm, mode).await,
            TRead { fid, offset, count }                => self.rread(fid, offset, count).await,
            TWrite { fid, offset, ref data }            => self.rwrite(fid, offset, data).await,
            TClunk { fid }                              => Ok(self.rclunk(fid).await),
            TRemove { fid }                             => self.rremove(fid).await,
            TStat { fid }                               => self.rstat(fid).await,
            TWStat { fid, ref stat }                    => self.rwstat(fid, stat).await,
            _                                           => res!(Ename::NotImpl),
        }
    }

    fn rversion(&mut self, msize: u32, version: &str) -> Result<FCall> {
        let (msize, version) = self.session.negotiate(msize, version)?;
        if version != VERSION_UNKNOWN {
            self.fids.destroy_all();
        }

        Ok(FCall::RVersion {
            msize,
            version: version.to_owned(),
        })
    }

    async fn rattach(&mut self, fid: u32) -> Result<FCall> {
        let f = self.fids.create(fid, PathBuf::new())?;
        match f.refresh(&self.root).await {
            Ok(qid) => Ok(FCall::RAttach { qid }),
            Err(e) => {
                self.fids.remove(fid);
                Err(e)
            }
        }
    }

    async fn rwalk(&mut self, fid: u32, newfid: u32, wnames: &[String]) -> Result<FCall> {
        let from = self.fids.find(fid).ok_or(Ename::UnknownFid)?;
        if from.is_open() {
            return res!(Ename::Botch);
        }
        if newfid != fid && self.fids.contains(newfid) {
            return res!(Ename::DupFid);
        }

        let mut shadow = from.path().to_path_buf();
        if wnames.is_empty() {
            if newfid != fid {
                self.fids.create(newfid, shadow)?;
            }
            return Ok(FCall::RWalk { wqids: Vec::new() });
        }

        let mut wqids = Vec::with_capacity(wnames.len());
        for name in wnames.iter().take(MAXWELEM) {
            match fs::walk(&self.root, &shadow, name).await {
                Ok((next, qid)) => {
                    shadow = next;
                    wqids.push(qid);
                }
                Err(e) => {
                    if self.config.debug {
                        info!("walk stopped at {:?}: {}", name, e);
                    }
                    break;
                }
            }
        }

        if wqids.len() == wnames.len() {
            if newfid == fid {
                let f = self.fids.get_mut(fid)?;
                f.set_path(shadow);
                f.refresh(&self.root).await?;
            } else {
                let f = self.fids.create(newfid, shadow)?;
                f.refresh(&self.root).await?;
            }
        } else if newfid != fid {
            return res!(Ename::NotFound);
        }

        Ok(FCall::RWalk { wqids })
    }

    async fn ropen(&mut self, fid: u32, mode: u8) -> Result<FCall> {
        let iounit = self.session.iounit();
        let f = self.fids.get_mut(fid)?;
        let qid = f.open(&self.root, mode).await?;

        Ok(FCall::ROpen { qid, iounit })
    }

    async fn rcreate(&mut self, fid: u32, name: &str, perm: u32, mode: u8) -> Result<FCall> {
        let iounit = self.session.iounit();
        let f = self.fids.get_mut(fid)?;

        if !f.is_open() {
            f.refresh(&self.root).await?;
        }
        if !f.is_dir() {
            return res!(Ename::CreateNonDir);
        }

        let dir = f.host_path(&self.root);
        match f.mode() {
            Some(open) if !om::writable(open) => return res!(Ename::Perm),
            Some(_) => {}
            None => {
                if nix::unistd::access(&dir, AccessFlags::W_OK).is_err() {
                    return res!(Ename::Perm);
                }
            }
        }
        if perm & dm::DIR != 0 && (om::access(mode) != om::READ || mode & om::TRUNC != 0) {
            return res!(Ename::IsDir);
        }

        let (_, file) = fs::create(&dir, name, perm, mode).await?;
        let child = f.path().join(name);
        f.retarget(child);

        let qid = match file {
            Some(file) => {
                let qid = f.refresh(&self.root).await?;
                f.bind(file, mode);
                qid
            }
            None => f.open(&self.root, mode).await?,
        };

        Ok(FCall::RCreate { qid, iounit })
    }

    async fn rread(&mut self, fid: u32, offset: u64, count: u32) -> Result<FCall> {
        let count = count.min(self.session.iounit());
        let f = self.fids.get_mut(fid)?;

        let mode = f.mode().ok_or(Ename::Botch)?;
        if !om::readable(mode) {
            return res!(Ename::Perm);
        }

        let host = f.host_path(&self.root);
        let data = match f.handle_mut() {
            Some(Handle::Dir(cursor)) => fs::read_directory(&host, cursor, offset, count).await?,
            Some(Handle::File(file)) => fs::read(file, offset, count).await?,
            None => return res!(Ename::Botch),
        };

        Ok(FCall::RRead { data: Data(data) })
    }

    async fn rwrite(&mut self, fid: u32, offset: u64, data: &Data) -> Result<FCall> {
        let f = self.fids.get_mut(fid)?;
        let mode = f.mode().ok_or(Ename::Botch)?;

        let count = match f.handle_mut() {
            Some(Handle::Dir(_)) => return res!(Ename::IsDir),
            Some(Handle::File(_)) if !om::writable(mode) => return res!(Ename::Perm),
            Some(Handle::File(file)) => fs::write(file, offset, &data.0).await?,
            None => return res!(Ename::Botch),
        };
        f.invalidate();

        Ok(FCall::RWrite { count })
    }

    async fn rclunk(&mut self, fid: u32) -> FCall {
        let Some(f) = self.fids.release(fid) else {
            return FCall::RClunk;
        };

        if f.remove_on_close() {
            let host = f.host_path(&self.root);
            drop(f);
            if let Err(e) = fs::remove(&host).await {
                warn!("Failed to remove {:?} on clunk: {}", host, e);
            }
        }

        FCall::RClunk
    }

    async fn rremove(&mut self, fid: u32) -> Result<FCall> {
        let f = self.fids.find(fid).ok_or(Ename::UnknownFid)?;
        if f.is_root() {
            return res!(Ename::NoRemove);
        }
        if f.is_open() {
            return res!(Ename::Perm);
        }

        let host = f.host_path(&self.root);
        let removed = fs::remove(&host).await;
        self.fids.remove(fid);
        removed?;

        Ok(FCall::RRemove)
    }

    async fn rstat(&mut self, fid: u32) -> Result<FCall> {
        let f = self.fids.find(fid).ok_or(Ename::UnknownFid)?;
        let stat = fs::stat(&self.root, f.path()).await?;

        Ok(FCall::RStat { stat })
    }

    async fn rwstat(&mut self, fid: u32, stat: &Stat) -> Result<FCall> {
        let f = self.fids.get_mut(fid)?;
        let path = fs::wstat(&self.root, f.path(), stat).await?;
        f.set_path(path);
        f.refresh(&self.root).await?;

        Ok(FCall::RWStat)
    }

    /// Accept connections on `addr` one at a time, running a fresh session on each.
    ///
    /// `addr` is `tcp!host!port` or `unix!path!suffix`.
    pub async fn serve(&mut self, addr: &str) -> Result<()> {
        let (proto, host, port) = utils::parse_proto(addr)
            .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

        match proto {
            "tcp" => self.serve_tcp(&format!("{}:{}", host, port)).await,
            "unix" => self.serve_unix(&format!("{}:{}", host, port)).await,
            _ => res!(io_err!(InvalidInput, "Protocol not supported")),
        }
    }

    async fn serve_tcp(&mut self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        let shutdown = self.shutdown.clone();

        while !shutdown.is_triggered() {
            let (stream, peer) = tokio::select! {
                _ = shutdown.wait() => break,
                accepted = listener.accept() => accepted?,
            };
            info!("accepted: {:?}", peer);

            let (readhalf, writehalf) = stream.into_split();
            self.set_endpoints(readhalf, writehalf);
            if let Err(e) = self.run().await {
                error!("Error: {}: {:?}", e, e);
            }
        }

        info!("Server shutdown complete");
        Ok(())
    }

    async fn serve_unix(&mut self, addr: &str) -> Result<()> {
        let listener = DeleteOnDrop::bind(addr)?;
        let shutdown = self.shutdown.clone();

        while !shutdown.is_triggered() {
            let (stream, peer) = tokio::select! {
                _ = shutdown.wait() => break,
                accepted = listener.accept() => accepted?,
            };
            info!("accepted: {:?}", peer);

            let (readhalf, writehalf) = stream.into_split();
            self.set_endpoints(readhalf, writehalf);
            if let Err(e) = self.run().await {
                error!("Error: {}: {:?}", e, e);
            }
        }

        info!("Server shutdown complete");
        Ok(())
    }
}

/// Unix listener whose socket file goes away with it
struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_wakes_waiters() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait().await })
        };

        tokio::task::yield_now().await;
        shutdown.trigger();
        waiter.await.unwrap();
        assert!(shutdown.is_triggered());

        // Already triggered: returns at once
        shutdown.wait().await;
    }

    #[tokio::test]
    async fn run_needs_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = Server::new(dir.path(), false);
        assert!(server.run().await.is_err());
    }

    #[tokio::test]
    async fn malformed_frames_get_untagged_botch() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = Server::new(dir.path(), false);

        let mut frame = vec![7, 0, 0, 0, 99, 1, 0];
        let response = server.handle_frame(&frame).await.unwrap();
        let response = serialize::decode_msg(&response).unwrap();
        assert_eq!(response.tag, NOTAG);
        assert_eq!(response.body, FCall::rerror("protocol botch"));

        frame[4] = MsgType::TClunk as u8;
        let response = server.handle_frame(&frame).await.unwrap();
        assert_eq!(serialize::decode_msg(&response).unwrap().tag, NOTAG);
    }

    #[tokio::test]
    async fn tiny_msize_is_refused_with_a_reply() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = Server::new(dir.path(), false);

        let version = |tag, msize| Msg {
            tag,
            body: FCall::TVersion { msize, version: P92000.to_owned() },
        };

        let request = serialize::encode_msg(&version(NOTAG, 16), MAXMSG).unwrap();
        let response = server.handle_frame(&request).await.unwrap();
        let response = serialize::decode_msg(&response).unwrap();
        assert_eq!(response.tag, NOTAG);
        assert_eq!(response.body, FCall::rerror("invalid argument"));
        assert_eq!(server.session().msize(), MAXMSG);

        // The session is still usable afterwards
        let request = serialize::encode_msg(&version(NOTAG, MINMSG), MAXMSG).unwrap();
        let response = server.handle_frame(&request).await.unwrap();
        assert_eq!(
            serialize::decode_msg(&response).unwrap().body,
            FCall::RVersion { msize: MINMSG, version: P92000.to_owned() }
        );
        assert_eq!(server.session().msize(), MINMSG);
    }

    #[tokio::test]
    async fn oversized_responses_become_io_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big"), vec![b'x'; 4096]).unwrap();
        let mut server = Server::new(dir.path(), false);

        let call = |tag, body| Msg { tag, body };
        server.handle_message(&call(1, FCall::TVersion { msize: 256, version: P92000.to_owned() })).await;
        server.handle_message(&call(2, FCall::TAttach { fid: 0, afid: NOFID, uname: String::new(), aname: String::new() })).await;
        server.handle_message(&call(3, FCall::TWalk { fid: 0, newfid: 1, wnames: vec!["big".to_owned()] })).await;
        server.handle_message(&call(4, FCall::TOpen { fid: 1, mode: om::READ })).await;

        // Reads are clamped to the iounit, so the encoder never overflows
        let frame = call(5, FCall::TRead { fid: 1, offset: 0, count: 4096 });
        let response = server.handle_message(&frame).await;
        match response.body {
            FCall::RRead { ref data } => assert_eq!(data.0.len() as u32, 256 - IOHDRSZ),
            ref other => panic!("unexpected {:?}", other),
        }

        // A response too large for msize falls back to an i/o error on the same tag
        let huge = call(6, FCall::RRead { data: Data(vec![0; 1024]) });
        let frame = server.encode_response(&huge, server.session().msize()).unwrap();
        let fallback = serialize::decode_msg(&frame).unwrap();
        assert_eq!(fallback.tag, 6);
        assert_eq!(fallback.body, FCall::rerror("i/o error"));
    }
}
