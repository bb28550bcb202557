//! Creation of output writers from run settings.

use crate::color::{ColorContext, Debayer};
use crate::file_save::{max_frames_per_file, FileSave};
use crate::prd_writer::{PrdFileSave, PrdOptions};
use crate::tiff_writer::{page_bytes, TiffFileSave, TIFF_FILE_OVERHEAD, TIFF_PAGE_OVERHEAD};
use daq_core::frame::AcqCfg;
use daq_core::settings::{Settings, StorageType};
use daq_core::{AcqError, AcqResult};
use std::sync::Arc;

/// Builds the writers of one acquisition.
pub trait StorageFactory: Send + Sync {
    /// Frames stored per output file.
    fn frames_per_file(&self, cfg: &AcqCfg, settings: &Settings) -> AcqResult<usize>;

    /// Unopened writer for output file number `index`.
    fn create(
        &self,
        index: usize,
        cfg: &Arc<AcqCfg>,
        settings: &Settings,
    ) -> AcqResult<Box<dyn FileSave>>;
}

/// PRD and TIFF writers as selected by `storage_type`.
#[derive(Clone, Default)]
pub struct DefaultStorageFactory {
    debayer: Option<Arc<dyn Debayer>>,
}

impl std::fmt::Debug for DefaultStorageFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultStorageFactory")
            .field("custom_debayer", &self.debayer.is_some())
            .finish()
    }
}

impl DefaultStorageFactory {
    /// Use `debayer` instead of the built-in demosaicing for colour TIFFs.
    #[must_use]
    pub fn with_debayer(debayer: Arc<dyn Debayer>) -> Self {
        Self {
            debayer: Some(debayer),
        }
    }

    fn color(&self, cfg: &AcqCfg, settings: &Settings) -> AcqResult<Option<ColorContext>> {
        let ctx = ColorContext::for_acquisition(cfg, &settings.color)?;
        Ok(ctx.map(|mut ctx| {
            if let Some(debayer) = &self.debayer {
                ctx.debayer = Arc::clone(debayer);
            }
            ctx
        }))
    }
}

impl StorageFactory for DefaultStorageFactory {
    fn frames_per_file(&self, cfg: &AcqCfg, settings: &Settings) -> AcqResult<usize> {
        match settings.storage_type {
            StorageType::None => Ok(1),
            StorageType::Prd => {
                let header = PrdOptions::from_settings(cfg, settings).header(cfg);
                max_frames_per_file(
                    settings.max_stack_size,
                    header.header_block_size(),
                    header.record_size(),
                )
            }
            StorageType::Tiff | StorageType::BigTiff => {
                let color = self.color(cfg, settings)?;
                max_frames_per_file(
                    settings.max_stack_size,
                    TIFF_FILE_OVERHEAD,
                    page_bytes(cfg, color.as_ref()) + TIFF_PAGE_OVERHEAD,
                )
            }
        }
    }

    fn create(
        &self,
        index: usize,
        cfg: &Arc<AcqCfg>,
        settings: &Settings,
    ) -> AcqResult<Box<dyn FileSave>> {
        let path = settings
            .file_name(index)
            .ok_or_else(|| AcqError::config("storage type 'none' has no output files"))?;
        match settings.storage_type {
            StorageType::None => Err(AcqError::config("storage type 'none' has no output files")),
            StorageType::Prd => Ok(Box::new(PrdFileSave::new(
                path,
                Arc::clone(cfg),
                PrdOptions::from_settings(cfg, settings),
            ))),
            StorageType::Tiff | StorageType::BigTiff => Ok(Box::new(TiffFileSave::new(
                path,
                Arc::clone(cfg),
                settings.storage_type == StorageType::BigTiff,
                self.color(cfg, settings)?,
            )?)),
        }
    }
}
