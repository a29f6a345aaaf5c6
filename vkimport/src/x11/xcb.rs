// PixmapSource on an x11rb connection
//
// Austin Shafer - 2021
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::dri3::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{ConnectionExt as _, ImageFormat};

use super::{Dri3Buffer, PixmapGeometry, PixmapImage, PixmapSource};
use crate::{Result, VkImportError};
use utils::log;
use utils::region::Rect;

use std::cell::OnceCell;
use std::fmt::Display;
use std::os::fd::OwnedFd;
use std::rc::Rc;

fn x11_err<E: Display>(req: &str, e: E) -> VkImportError {
    log::error!("X11 {} failed: {}", req, e);
    VkImportError::X11_ERROR(format!("{}: {}", req, e))
}

/// Reads pixmaps from an X server
pub struct X11PixmapSource<C: Connection> {
    xs_conn: Rc<C>,
    /// DRI3 support, asked for the first time it is needed
    xs_dri3: OnceCell<bool>,
}

impl<C: Connection> X11PixmapSource<C> {
    pub fn new(conn: Rc<C>) -> Self {
        Self {
            xs_conn: conn,
            xs_dri3: OnceCell::new(),
        }
    }

    pub fn connection(&self) -> &Rc<C> {
        &self.xs_conn
    }

    fn query_dri3(&self) -> bool {
        match self.xs_conn.extension_information(dri3::X11_EXTENSION_NAME) {
            Ok(Some(_)) => {}
            Ok(None) => {
                log::debug!("X server does not have DRI3");
                return false;
            }
            Err(e) => {
                log::warn!("Could not query for DRI3: {}", e);
                return false;
            }
        }

        let reply = self
            .xs_conn
            .dri3_query_version(1, 0)
            .map_err(|e| x11_err("DRI3QueryVersion", e))
            .and_then(|cookie| cookie.reply().map_err(|e| x11_err("DRI3QueryVersion", e)));

        match reply {
            Ok(v) => {
                log::debug!("X server has DRI3 {}.{}", v.major_version, v.minor_version);
                v.major_version >= 1
            }
            Err(_) => false,
        }
    }
}

impl<C: Connection> PixmapSource for X11PixmapSource<C> {
    fn geometry(&self, pixmap: u32) -> Result<PixmapGeometry> {
        let reply = self
            .xs_conn
            .get_geometry(pixmap)
            .map_err(|e| x11_err("GetGeometry", e))?
            .reply()
            .map_err(|e| x11_err("GetGeometry", e))?;

        Ok(PixmapGeometry {
            width: reply.width as u32,
            height: reply.height as u32,
            depth: reply.depth,
        })
    }

    fn has_dri3(&self) -> bool {
        *self.xs_dri3.get_or_init(|| self.query_dri3())
    }

    fn buffer_from_pixmap(&self, pixmap: u32) -> Result<Dri3Buffer> {
        let reply = self
            .xs_conn
            .dri3_buffer_from_pixmap(pixmap)
            .map_err(|e| x11_err("DRI3BufferFromPixmap", e))?
            .reply()
            .map_err(|e| x11_err("DRI3BufferFromPixmap", e))?;

        Ok(Dri3Buffer {
            fd: OwnedFd::from(reply.pixmap_fd),
            width: reply.width as u32,
            height: reply.height as u32,
            stride: reply.stride as u32,
            size: reply.size,
            depth: reply.depth,
            bpp: reply.bpp,
        })
    }

    fn get_image(&self, pixmap: u32, rect: &Rect<i32>) -> Result<PixmapImage> {
        let reply = self
            .xs_conn
            .get_image(
                ImageFormat::Z_PIXMAP,
                pixmap,
                rect.r_pos.0 as i16,
                rect.r_pos.1 as i16,
                rect.r_size.0 as u16,
                rect.r_size.1 as u16,
                !0,
            )
            .map_err(|e| x11_err("GetImage", e))?
            .reply()
            .map_err(|e| x11_err("GetImage", e))?;

        Ok(PixmapImage {
            width: rect.r_size.0 as u32,
            height: rect.r_size.1 as u32,
            depth: reply.depth,
            data: reply.data,
        })
    }
}
