//! Firmware package reader for Nordic DFU.
//!
//! Reads and parses a DFU `.zip` package containing:
//! - manifest.json - Package metadata naming the image and init files
//! - *.bin - Firmware image
//! - *.dat - Init packet (signed for Secure DFU, plain for Legacy DFU)

use std::io::{Read, Seek};
use std::path::Path;

use serde::Deserialize;

use super::error::{DfuError, DfuResult};
use super::packet::{wire_len, ImageSizes, ImageType};

/// Immutable firmware image buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage(Box<[u8]>);

/// Immutable init packet buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitPacket(Box<[u8]>);

macro_rules! impl_buffer {
    ($ty:ident) => {
        impl $ty {
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn len(&self) -> usize {
                self.0.len()
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl From<Vec<u8>> for $ty {
            fn from(data: Vec<u8>) -> Self {
                Self(data.into_boxed_slice())
            }
        }
    };
}

impl_buffer!(FirmwareImage);
impl_buffer!(InitPacket);

/// Contents of a DFU firmware package.
#[derive(Debug, Clone)]
pub struct FirmwarePackage {
    /// Init packet (dat_file contents).
    pub init_packet: InitPacket,
    /// Firmware image (bin_file contents).
    pub image: FirmwareImage,
    /// Which firmware component the image replaces.
    pub image_type: ImageType,
    /// Parsed manifest metadata.
    pub manifest: ManifestData,
}

impl FirmwarePackage {
    /// Sizes announced to legacy bootloaders in the Start DFU header.
    pub fn image_sizes(&self) -> DfuResult<ImageSizes> {
        let len = wire_len(self.image.len())?;
        let sizes = match self.image_type {
            ImageType::Application => ImageSizes {
                application: len,
                ..Default::default()
            },
            ImageType::Bootloader => ImageSizes {
                bootloader: len,
                ..Default::default()
            },
            ImageType::SoftDevice => ImageSizes {
                softdevice: len,
                ..Default::default()
            },
            ImageType::SoftDeviceBootloader => ImageSizes {
                softdevice: self.manifest.softdevice_size.unwrap_or(0),
                bootloader: self.manifest.bootloader_size.unwrap_or(0),
                application: 0,
            },
        };
        Ok(sizes)
    }
}

/// Parsed manifest.json data.
#[derive(Debug, Clone, Default)]
pub struct ManifestData {
    /// DFU version from manifest (legacy packages only).
    pub dfu_version: Option<f32>,
    /// Device type from legacy init packet data.
    pub device_type: Option<u16>,
    /// CRC16 of the firmware from legacy init packet data.
    pub firmware_crc16: Option<u16>,
    /// SoftDevice part of a combined SoftDevice + bootloader image.
    pub softdevice_size: Option<u32>,
    /// Bootloader part of a combined SoftDevice + bootloader image.
    pub bootloader_size: Option<u32>,
    /// Name of the binary file.
    bin_file: String,
    /// Name of the init packet file.
    dat_file: String,
}

/// Raw manifest.json structure for deserialization.
#[derive(Debug, Deserialize)]
struct RawManifest {
    manifest: ManifestInner,
}

#[derive(Debug, Deserialize)]
struct ManifestInner {
    application: Option<ImageEntry>,
    bootloader: Option<ImageEntry>,
    softdevice: Option<ImageEntry>,
    softdevice_bootloader: Option<ImageEntry>,
    dfu_version: Option<f32>,
}

impl ManifestInner {
    fn entry(&self, image_type: ImageType) -> Option<&ImageEntry> {
        match image_type {
            ImageType::Application => self.application.as_ref(),
            ImageType::Bootloader => self.bootloader.as_ref(),
            ImageType::SoftDevice => self.softdevice.as_ref(),
            ImageType::SoftDeviceBootloader => self.softdevice_bootloader.as_ref(),
        }
    }

    fn present(&self) -> Vec<ImageType> {
        [
            ImageType::Application,
            ImageType::Bootloader,
            ImageType::SoftDevice,
            ImageType::SoftDeviceBootloader,
        ]
        .into_iter()
        .filter(|image_type| self.entry(*image_type).is_some())
        .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ImageEntry {
    bin_file: String,
    dat_file: String,
    init_packet_data: Option<InitPacketData>,
    info_read_only_metadata: Option<SizeMetadata>,
}

// Only device_type and firmware_crc16 are surfaced
#[derive(Debug, Deserialize)]
struct InitPacketData {
    device_type: Option<u16>,
    firmware_crc16: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct SizeMetadata {
    bl_size: u32,
    sd_size: u32,
}

/// Read and parse a firmware.zip package.
///
/// Selects the application image when the manifest lists several, otherwise
/// the only image present.
///
/// # Arguments
/// * `path` - Path to the firmware.zip file
///
/// # Returns
/// Parsed firmware package with init packet, firmware image, and manifest
pub fn read_firmware_zip<P: AsRef<Path>>(path: P) -> DfuResult<FirmwarePackage> {
    let file = std::fs::File::open(path.as_ref())?;
    read_firmware_package(file, None)
}

/// Read a specific image from a firmware.zip package.
pub fn read_firmware_zip_image<P: AsRef<Path>>(
    path: P,
    image_type: ImageType,
) -> DfuResult<FirmwarePackage> {
    let file = std::fs::File::open(path.as_ref())?;
    read_firmware_package(file, Some(image_type))
}

/// Read a firmware package from any seekable reader.
pub fn read_firmware_package<R: Read + Seek>(
    reader: R,
    image_type: Option<ImageType>,
) -> DfuResult<FirmwarePackage> {
    let mut archive = zip::ZipArchive::new(reader)?;

    let (image_type, manifest) = read_manifest(&mut archive, image_type)?;
    let init_packet = read_file_from_zip(&mut archive, &manifest.dat_file)?;
    let image = read_file_from_zip(&mut archive, &manifest.bin_file)?;

    if image.is_empty() {
        return Err(DfuError::InvalidManifest {
            reason: format!("{} is empty", manifest.bin_file),
        });
    }

    tracing::debug!(
        image_type = %image_type,
        image_len = image.len(),
        init_len = init_packet.len(),
        "Loaded firmware package"
    );

    Ok(FirmwarePackage {
        init_packet: init_packet.into(),
        image: image.into(),
        image_type,
        manifest,
    })
}

/// Read and parse the manifest.json from the archive.
fn read_manifest<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    wanted: Option<ImageType>,
) -> DfuResult<(ImageType, ManifestData)> {
    let mut manifest_file = archive.by_name("manifest.json").map_err(|_| {
        DfuError::MissingFile {
            filename: "manifest.json".to_string(),
        }
    })?;

    let mut contents = String::new();
    manifest_file.read_to_string(&mut contents)?;

    let raw: RawManifest = serde_json::from_str(&contents)?;
    let inner = raw.manifest;

    let image_type = match wanted {
        Some(image_type) => image_type,
        None => {
            let present = inner.present();
            if present.contains(&ImageType::Application) {
                ImageType::Application
            } else {
                match present.as_slice() {
                    [only] => *only,
                    [] => {
                        return Err(DfuError::InvalidManifest {
                            reason: "no firmware image listed".to_string(),
                        })
                    }
                    _ => {
                        return Err(DfuError::InvalidManifest {
                            reason: format!("ambiguous image selection: {:?}", present),
                        })
                    }
                }
            }
        }
    };

    let entry = inner.entry(image_type).ok_or_else(|| DfuError::InvalidManifest {
        reason: format!("no {} image listed", image_type),
    })?;

    let sizes = entry.info_read_only_metadata.as_ref();
    if image_type == ImageType::SoftDeviceBootloader && sizes.is_none() {
        return Err(DfuError::InvalidManifest {
            reason: "softdevice_bootloader entry lacks info_read_only_metadata".to_string(),
        });
    }

    let manifest = ManifestData {
        dfu_version: inner.dfu_version,
        device_type: entry.init_packet_data.as_ref().and_then(|d| d.device_type),
        firmware_crc16: entry.init_packet_data.as_ref().and_then(|d| d.firmware_crc16),
        softdevice_size: sizes.map(|s| s.sd_size),
        bootloader_size: sizes.map(|s| s.bl_size),
        bin_file: entry.bin_file.clone(),
        dat_file: entry.dat_file.clone(),
    };
    Ok((image_type, manifest))
}

/// Read a file from the zip archive by name.
fn read_file_from_zip<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
) -> DfuResult<Vec<u8>> {
    let mut file = archive.by_name(name).map_err(|_| DfuError::MissingFile {
        filename: name.to_string(),
    })?;

    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data)?;

    Ok(data)
}
