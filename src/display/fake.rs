//! In-memory display server for tests.
//!
//! Records every request in a shared [`FakeState`] so tests can inspect
//! what the output layer did, and can break the connection on demand.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::{Connector, DisplayError, DisplayServer, DrawableInfo, RootProperty, Xid};
use crate::geometry::{Rect, Size};
use crate::output::surface::PixelImage;
use crate::output::topology::Viewport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutRecord {
    pub drawable: Xid,
    pub gc: Xid,
    pub depth: u8,
    pub src: Rect,
    pub dst_x: i32,
    pub dst_y: i32,
}

#[derive(Debug)]
pub struct FakeState {
    pub root: Size,
    pub root_depth: u8,
    /// `None` simulates a server without RandR.
    pub outputs: Option<Vec<Viewport>>,
    pub region_shape: Option<(u32, u32)>,

    next_id: Xid,
    pixmaps: HashMap<Xid, DrawableInfo>,
    foreign: HashMap<Xid, DrawableInfo>,
    pub gcs: HashMap<Xid, Xid>,
    pub windows: HashMap<Xid, Rect>,

    pub properties: HashMap<RootProperty, Xid>,
    pub root_background: Option<Xid>,
    pub clears: Vec<Rect>,
    pub fills: Vec<(Xid, Rect)>,
    pub copies: Vec<(Xid, Xid, Size)>,
    pub puts: Vec<PutRecord>,
    pub property_writes: usize,
    pub background_writes: usize,

    pub fail_create_gc: bool,
    pub fail_create_window: bool,
    /// The next upload is rejected with a protocol error.
    pub fail_next_put: bool,
    /// Reported by the next `dispatch_errors`.
    pub pending_protocol_errors: usize,

    /// New connections are refused while false.
    pub reachable: bool,
    epoch: u64,
    pub connections: usize,
    pub open_connections: usize,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            root: Size::new(3200, 1080),
            root_depth: 24,
            outputs: Some(Vec::new()),
            region_shape: Some((5, 0)),
            next_id: 0x0040_0001,
            pixmaps: HashMap::new(),
            foreign: HashMap::new(),
            gcs: HashMap::new(),
            windows: HashMap::new(),
            properties: HashMap::new(),
            root_background: None,
            clears: Vec::new(),
            fills: Vec::new(),
            copies: Vec::new(),
            puts: Vec::new(),
            property_writes: 0,
            background_writes: 0,
            fail_create_gc: false,
            fail_create_window: false,
            fail_next_put: false,
            pending_protocol_errors: 0,
            reachable: true,
            epoch: 0,
            connections: 0,
            open_connections: 0,
        }
    }
}

impl FakeState {
    pub fn shared() -> Rc<RefCell<FakeState>> {
        Rc::new(RefCell::new(FakeState::default()))
    }

    fn allocate_id(&mut self) -> Xid {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// A pixmap owned by some other client, e.g. a previous wallpaper
    /// setter. Not counted as a live resource.
    pub fn foreign_pixmap(&mut self, size: Size, depth: u8) -> Xid {
        let id = self.allocate_id();
        self.foreign.insert(id, DrawableInfo { size, depth });
        id
    }

    /// Resources created through a fake server and not yet freed.
    pub fn live_resources(&self) -> Vec<Xid> {
        let mut live: Vec<Xid> = self
            .pixmaps
            .keys()
            .chain(self.gcs.keys())
            .chain(self.windows.keys())
            .copied()
            .collect();
        live.sort_unstable();
        live
    }

    /// Break every open connection. The server reclaims their resources;
    /// root properties keep pointing at the dead pixmap.
    pub fn sever(&mut self) {
        self.epoch += 1;
        self.pixmaps.clear();
        self.gcs.clear();
        self.windows.clear();
        self.root_background = None;
    }

    fn drawable(&self, id: Xid) -> Option<DrawableInfo> {
        if let Some(info) = self.pixmaps.get(&id).or_else(|| self.foreign.get(&id)) {
            return Some(*info);
        }
        self.windows.get(&id).map(|rect| DrawableInfo {
            size: rect.size(),
            depth: self.root_depth,
        })
    }
}

pub struct FakeServer {
    state: Rc<RefCell<FakeState>>,
    epoch: u64,
}

impl FakeServer {
    pub fn new(state: &Rc<RefCell<FakeState>>) -> Self {
        let epoch = {
            let mut st = state.borrow_mut();
            st.connections += 1;
            st.open_connections += 1;
            st.epoch
        };
        Self {
            state: Rc::clone(state),
            epoch,
        }
    }

    /// Borrow the state for a request, failing if this connection was
    /// severed.
    fn live(&self) -> Result<std::cell::RefMut<'_, FakeState>, DisplayError> {
        let st = self.state.borrow_mut();
        if st.epoch != self.epoch {
            return Err(DisplayError::Connection("connection reset by peer".into()));
        }
        Ok(st)
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        // Leaked resources stay visible to `live_resources`.
        self.state.borrow_mut().open_connections -= 1;
    }
}

fn bad(kind: &str, id: Xid) -> DisplayError {
    DisplayError::Protocol(format!("{kind} (resource 0x{id:x})"))
}

impl DisplayServer for FakeServer {
    fn root_size(&self) -> Size {
        self.state.borrow().root
    }

    fn root_depth(&self) -> u8 {
        self.state.borrow().root_depth
    }

    fn outputs(&mut self) -> Result<Vec<Viewport>, DisplayError> {
        self.live()?
            .outputs
            .clone()
            .ok_or(DisplayError::MissingExtension("RANDR"))
    }

    fn region_shape_version(&self) -> Option<(u32, u32)> {
        self.state.borrow().region_shape
    }

    fn create_pixmap(&mut self, size: Size, depth: u8) -> Result<Xid, DisplayError> {
        let mut st = self.live()?;
        if size.is_empty() {
            return Err(DisplayError::Protocol("BadValue (zero-sized pixmap)".into()));
        }
        let id = st.allocate_id();
        st.pixmaps.insert(id, DrawableInfo { size, depth });
        Ok(id)
    }

    fn free_pixmap(&mut self, pixmap: Xid) -> Result<(), DisplayError> {
        let mut st = self.live()?;
        st.pixmaps.remove(&pixmap).map(|_| ()).ok_or_else(|| bad("BadPixmap", pixmap))
    }

    fn create_gc(&mut self, drawable: Xid) -> Result<Xid, DisplayError> {
        let mut st = self.live()?;
        if st.fail_create_gc {
            return Err(DisplayError::Protocol("BadAlloc".into()));
        }
        if st.drawable(drawable).is_none() {
            return Err(bad("BadDrawable", drawable));
        }
        let id = st.allocate_id();
        st.gcs.insert(id, drawable);
        Ok(id)
    }

    fn free_gc(&mut self, gc: Xid) -> Result<(), DisplayError> {
        let mut st = self.live()?;
        st.gcs.remove(&gc).map(|_| ()).ok_or_else(|| bad("BadGC", gc))
    }

    fn root_pixmap(&mut self, property: RootProperty) -> Result<Option<Xid>, DisplayError> {
        Ok(self.live()?.properties.get(&property).copied())
    }

    fn drawable_info(&mut self, drawable: Xid) -> Result<Option<DrawableInfo>, DisplayError> {
        Ok(self.live()?.drawable(drawable))
    }

    fn fill_rectangle(&mut self, drawable: Xid, gc: Xid, rect: Rect) -> Result<(), DisplayError> {
        let mut st = self.live()?;
        if !st.gcs.contains_key(&gc) {
            return Err(bad("BadGC", gc));
        }
        st.fills.push((drawable, rect));
        Ok(())
    }

    fn copy_area(&mut self, src: Xid, dst: Xid, gc: Xid, size: Size) -> Result<(), DisplayError> {
        let mut st = self.live()?;
        let Some(info) = st.drawable(src) else {
            return Err(bad("BadDrawable", src));
        };
        if info.size.min(size) != size {
            return Err(DisplayError::Protocol("copy larger than source".into()));
        }
        if !st.gcs.contains_key(&gc) {
            return Err(bad("BadGC", gc));
        }
        st.copies.push((src, dst, size));
        Ok(())
    }

    fn put_image(
        &mut self,
        drawable: Xid,
        gc: Xid,
        depth: u8,
        image: &PixelImage,
        src: Rect,
        dst_x: i32,
        dst_y: i32,
    ) -> Result<(), DisplayError> {
        let mut st = self.live()?;
        if std::mem::take(&mut st.fail_next_put) {
            return Err(DisplayError::Protocol("BadMatch".into()));
        }
        if !image.rect().contains(&src) {
            return Err(DisplayError::Unsupported(format!(
                "source {src} outside image {}",
                image.size()
            )));
        }
        let Some(info) = st.drawable(drawable) else {
            return Err(bad("BadDrawable", drawable));
        };
        let target = Rect::new(0, 0, info.size.width, info.size.height);
        if !target.contains(&Rect::new(dst_x, dst_y, src.width, src.height)) {
            return Err(DisplayError::Protocol("upload outside drawable".into()));
        }
        st.puts.push(PutRecord {
            drawable,
            gc,
            depth,
            src,
            dst_x,
            dst_y,
        });
        Ok(())
    }

    fn set_root_background(&mut self, pixmap: Xid) -> Result<(), DisplayError> {
        let mut st = self.live()?;
        st.root_background = Some(pixmap);
        st.background_writes += 1;
        Ok(())
    }

    fn set_root_pixmap(&mut self, property: RootProperty, pixmap: Xid) -> Result<(), DisplayError> {
        let mut st = self.live()?;
        st.properties.insert(property, pixmap);
        st.property_writes += 1;
        Ok(())
    }

    fn clear_root_area(&mut self, rect: Rect) -> Result<(), DisplayError> {
        self.live()?.clears.push(rect);
        Ok(())
    }

    fn create_output_window(&mut self, rect: Rect, _name: &str) -> Result<Xid, DisplayError> {
        let mut st = self.live()?;
        if st.fail_create_window {
            return Err(DisplayError::Protocol("BadAlloc".into()));
        }
        let id = st.allocate_id();
        st.windows.insert(id, rect);
        Ok(id)
    }

    fn destroy_window(&mut self, window: Xid) -> Result<(), DisplayError> {
        let mut st = self.live()?;
        st.windows.remove(&window).map(|_| ()).ok_or_else(|| bad("BadWindow", window))
    }

    fn flush(&mut self) -> Result<(), DisplayError> {
        self.live().map(|_| ())
    }

    fn dispatch_errors(&mut self) -> Result<usize, DisplayError> {
        let mut st = self.live()?;
        Ok(std::mem::take(&mut st.pending_protocol_errors))
    }
}

pub struct FakeConnector {
    state: Rc<RefCell<FakeState>>,
}

impl FakeConnector {
    pub fn new(state: &Rc<RefCell<FakeState>>) -> Self {
        Self {
            state: Rc::clone(state),
        }
    }
}

impl Connector for FakeConnector {
    type Server = FakeServer;

    fn connect(&self) -> Result<FakeServer, DisplayError> {
        if !self.state.borrow().reachable {
            return Err(DisplayError::Connection("connection refused".into()));
        }
        Ok(FakeServer::new(&self.state))
    }
}
