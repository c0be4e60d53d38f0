//! SD card volume
//!
//! FAT volume on an SPI SD card through `embedded-sdmmc`. The card is
//! initialised at 400 kHz and the bus is raised to the working frequency once
//! it answers.

use defmt::{info, Format};
use depth_pipeline::system::storage::{LogFile, Volume};
use embassy_rp::gpio::{Level, Output};
use embassy_rp::spi::{self, Blocking, Spi};
use embassy_time::Delay;
use embedded_hal_bus::spi::ExclusiveDevice;
use embedded_sdmmc::{Mode, RawDirectory, RawFile, SdCard, TimeSource, Timestamp, VolumeIdx, VolumeManager};
use static_cell::StaticCell;

use super::resources::SdCardResources;

/// Clock during card initialisation
const SD_SPI_INIT_FREQ: u32 = 400_000;
/// Clock once the card is up
const SD_SPI_WORK_FREQ: u32 = 16_000_000;

type SdSpi = ExclusiveDevice<Spi<'static, embassy_rp::peripherals::SPI1, Blocking>, Output<'static>, Delay>;
type Card = SdCard<SdSpi, Delay>;
type Manager = VolumeManager<Card, FixedClock>;
pub type SdError = embedded_sdmmc::Error<embedded_sdmmc::SdCardError>;

static VOLUME_MANAGER: StaticCell<Manager> = StaticCell::new();

/// No RTC on the board, every file gets the same timestamp
pub struct FixedClock;

impl TimeSource for FixedClock {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp {
            year_since_1970: 55,
            zero_indexed_month: 0,
            zero_indexed_day: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}

/// Root directory of the first partition
pub struct SdVolume {
    manager: &'static Manager,
    root: RawDirectory,
}

/// Log file opened in append mode
pub struct SdLogFile {
    manager: &'static Manager,
    file: RawFile,
}

#[derive(Debug, Format)]
pub enum MountError {
    NoCard,
    Volume(SdError),
}

impl SdVolume {
    /// Brings up the card and opens the root directory
    pub fn mount(r: SdCardResources) -> Result<Self, MountError> {
        let mut config = spi::Config::default();
        config.frequency = SD_SPI_INIT_FREQ;
        let spi = Spi::new_blocking(r.spi, r.sck_pin, r.mosi_pin, r.miso_pin, config);
        let cs = Output::new(r.cs_pin, Level::High);
        let device = ExclusiveDevice::new(spi, cs, Delay).map_err(|_| MountError::NoCard)?;

        let card = SdCard::new(device, Delay);
        let size = card.num_bytes().map_err(|_| MountError::NoCard)?;
        info!("SD card found, {} bytes", size);

        card.spi(|device| device.bus_mut().set_frequency(SD_SPI_WORK_FREQ));

        let manager = VOLUME_MANAGER.init(VolumeManager::new(card, FixedClock));
        let volume = manager.open_raw_volume(VolumeIdx(0)).map_err(MountError::Volume)?;
        let root = manager.open_root_dir(volume).map_err(MountError::Volume)?;
        Ok(Self { manager, root })
    }
}

impl Volume for SdVolume {
    type Error = SdError;
    type File = SdLogFile;

    fn read(&mut self, name: &str, buf: &mut [u8]) -> Result<Option<usize>, SdError> {
        let file = match self.manager.open_file_in_dir(self.root, name, Mode::ReadOnly) {
            Ok(file) => file,
            Err(embedded_sdmmc::Error::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        let read = self.manager.read(file, buf);
        self.manager.close_file(file)?;
        read.map(Some)
    }

    fn replace(&mut self, name: &str, data: &[u8]) -> Result<(), SdError> {
        let file = self
            .manager
            .open_file_in_dir(self.root, name, Mode::ReadWriteCreateOrTruncate)?;
        let written = self.manager.write(file, data);
        self.manager.close_file(file)?;
        written
    }

    fn open_append(&mut self, name: &str) -> Result<SdLogFile, SdError> {
        let file = self
            .manager
            .open_file_in_dir(self.root, name, Mode::ReadWriteCreateOrAppend)?;
        Ok(SdLogFile {
            manager: self.manager,
            file,
        })
    }
}

impl LogFile for SdLogFile {
    type Error = SdError;

    fn write_all(&mut self, data: &[u8]) -> Result<(), SdError> {
        self.manager.write(self.file, data)
    }

    fn flush(&mut self) -> Result<(), SdError> {
        self.manager.flush_file(self.file)
    }

    fn sync(&mut self) -> Result<(), SdError> {
        // flushing updates the directory entry, which is all FAT has to commit
        self.manager.flush_file(self.file)
    }
}
