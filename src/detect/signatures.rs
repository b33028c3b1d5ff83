use super::{Confidence, FsType};

/// One entry of the ordered signature table.
pub(crate) struct Signature {
    pub name: &'static str,
    pub fs_type: FsType,
    pub probe: fn(&[u8], u64) -> Option<Probe>,
}

pub(crate) struct Probe {
    pub offset: u64,
    pub confidence: Confidence,
    pub variant: Option<&'static str>,
    pub evidence: Vec<String>,
}

/// Strongest magics first; YAFFS2 has no magic at all and goes last.
pub(crate) static SIGNATURES: &[Signature] = &[
    Signature { name: "squashfs", fs_type: FsType::SquashFs, probe: probe_squashfs },
    Signature { name: "cramfs", fs_type: FsType::CramFs, probe: probe_cramfs },
    Signature { name: "ext", fs_type: FsType::Ext, probe: probe_ext },
    Signature { name: "ubi", fs_type: FsType::Ubifs, probe: probe_ubi },
    Signature { name: "jffs2", fs_type: FsType::Jffs2, probe: probe_jffs2 },
    Signature { name: "yaffs2", fs_type: FsType::Yaffs2, probe: probe_yaffs2 },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

impl Endian {
    fn u16(self, buf: &[u8], offset: usize) -> Option<u16> {
        let bytes: [u8; 2] = buf.get(offset..offset.checked_add(2)?)?.try_into().ok()?;
        Some(match self {
            Endian::Little => u16::from_le_bytes(bytes),
            Endian::Big => u16::from_be_bytes(bytes),
        })
    }

    fn u32(self, buf: &[u8], offset: usize) -> Option<u32> {
        let bytes: [u8; 4] = buf.get(offset..offset.checked_add(4)?)?.try_into().ok()?;
        Some(match self {
            Endian::Little => u32::from_le_bytes(bytes),
            Endian::Big => u32::from_be_bytes(bytes),
        })
    }

    fn u64(self, buf: &[u8], offset: usize) -> Option<u64> {
        let bytes: [u8; 8] = buf.get(offset..offset.checked_add(8)?)?.try_into().ok()?;
        Some(match self {
            Endian::Little => u64::from_le_bytes(bytes),
            Endian::Big => u64::from_be_bytes(bytes),
        })
    }

    fn label(self) -> &'static str {
        match self {
            Endian::Little => "little-endian",
            Endian::Big => "big-endian",
        }
    }
}

// ==== SQUASHFS ====

const SQUASHFS_SUPERBLOCK_LEN: u64 = 96;

fn probe_squashfs(buf: &[u8], file_len: u64) -> Option<Probe> {
    let (endian, vendor) = match buf.get(0..4)? {
        b"hsqs" => (Endian::Little, false),
        b"sqsh" => (Endian::Big, false),
        // LZMA builds shipped by some router vendors
        b"shsq" => (Endian::Little, true),
        b"qshs" => (Endian::Big, true),
        _ => return None,
    };
    let major = endian.u16(buf, 28)?;
    let mut evidence = vec![format!("{} superblock magic", endian.label())];

    if vendor {
        if !(1..=4).contains(&major) {
            return None;
        }
        evidence.push(format!("vendor magic with version {}", major));
        return Some(Probe {
            offset: 0,
            confidence: Confidence::Low,
            variant: Some("squashfs-vendor"),
            evidence,
        });
    }

    match major {
        4 => {
            let block_size = endian.u32(buf, 12)?;
            let compression = endian.u16(buf, 20)?;
            let block_log = endian.u16(buf, 22)?;
            let bytes_used = endian.u64(buf, 40)?;
            let inode_table = endian.u64(buf, 64)?;
            let directory_table = endian.u64(buf, 72)?;

            if !block_size.is_power_of_two() || !(4096..=1 << 20).contains(&block_size) {
                return None;
            }
            if u32::from(block_log) != block_size.trailing_zeros() {
                return None;
            }
            if !(1..=6).contains(&compression) {
                return None;
            }
            if bytes_used < SQUASHFS_SUPERBLOCK_LEN || bytes_used > file_len {
                return None;
            }
            if inode_table >= bytes_used || directory_table >= bytes_used {
                return None;
            }

            evidence.push(format!("version 4, block size {}", block_size));
            evidence.push(format!("bytes_used {} fits in {} byte file", bytes_used, file_len));
            evidence.push(format!("compression id {}", compression));
            Some(Probe {
                offset: 0,
                confidence: Confidence::High,
                variant: None,
                evidence,
            })
        }
        3 => {
            // v3 superblock is packed, so the fields sit at odd offsets
            let block_log = endian.u16(buf, 34)?;
            let bytes_used = endian.u64(buf, 63)?;
            if !(12..=20).contains(&block_log) {
                return None;
            }
            if bytes_used == 0 || bytes_used > file_len {
                return None;
            }
            evidence.push(format!("version 3, block log {}", block_log));
            evidence.push(format!("bytes_used {} fits in {} byte file", bytes_used, file_len));
            Some(Probe {
                offset: 0,
                confidence: Confidence::Medium,
                variant: Some("squashfs-v3"),
                evidence,
            })
        }
        1 | 2 => {
            let block_log = endian.u16(buf, 34)?;
            if !(12..=16).contains(&block_log) {
                return None;
            }
            evidence.push(format!("legacy version {}", major));
            Some(Probe {
                offset: 0,
                confidence: Confidence::Low,
                variant: Some("squashfs-legacy"),
                evidence,
            })
        }
        _ => None,
    }
}

// ==== CRAMFS ====

const CRAMFS_SIGNATURE: &[u8] = b"Compressed ROMFS";
const CRAMFS_SUPERBLOCK_LEN: u64 = 76;

fn probe_cramfs(buf: &[u8], file_len: u64) -> Option<Probe> {
    // Some bootloaders expect a 512 byte pad in front of the superblock
    [0usize, 512]
        .into_iter()
        .find_map(|offset| cramfs_at(buf, file_len, offset))
}

fn cramfs_at(buf: &[u8], file_len: u64, offset: usize) -> Option<Probe> {
    let endian = match buf.get(offset..offset + 4)? {
        [0x45, 0x3d, 0xcd, 0x28] => Endian::Little,
        [0x28, 0xcd, 0x3d, 0x45] => Endian::Big,
        _ => return None,
    };
    if buf.get(offset + 16..offset + 32)? != CRAMFS_SIGNATURE {
        return None;
    }
    let size = u64::from(endian.u32(buf, offset + 4)?);
    if size < CRAMFS_SUPERBLOCK_LEN || offset as u64 + size > file_len {
        return None;
    }
    let files = endian.u32(buf, offset + 44)?;

    Some(Probe {
        offset: offset as u64,
        confidence: Confidence::High,
        variant: None,
        evidence: vec![
            format!("{} magic at {:#x}", endian.label(), offset),
            "\"Compressed ROMFS\" signature".to_string(),
            format!("declared size {} fits in {} byte file", size, file_len),
            format!("{} files", files),
        ],
    })
}

// ==== EXT2/3/4 ====

const EXT_SUPERBLOCK_OFFSET: usize = 1024;
const EXT_MAGIC: u16 = 0xEF53;
const EXT3_COMPAT_HAS_JOURNAL: u32 = 0x4;
const EXT4_INCOMPAT_MASK: u32 = 0x40 | 0x80 | 0x200; // extents, 64bit, flex_bg

fn probe_ext(buf: &[u8], file_len: u64) -> Option<Probe> {
    let sb = buf.get(EXT_SUPERBLOCK_OFFSET..EXT_SUPERBLOCK_OFFSET + 0x68)?;
    let le = Endian::Little;
    if le.u16(sb, 0x38)? != EXT_MAGIC {
        return None;
    }

    let inodes = le.u32(sb, 0x00)?;
    let blocks = u64::from(le.u32(sb, 0x04)?);
    let log_block_size = le.u32(sb, 0x18)?;
    let rev_level = le.u32(sb, 0x4c)?;
    let compat = le.u32(sb, 0x5c)?;
    let incompat = le.u32(sb, 0x60)?;

    if log_block_size > 6 || inodes == 0 || blocks == 0 || rev_level > 1 {
        return None;
    }
    let block_size = 1024u64 << log_block_size;
    let declared = blocks.checked_mul(block_size)?;
    if declared > file_len {
        return None;
    }

    let variant = if incompat & EXT4_INCOMPAT_MASK != 0 {
        "ext4"
    } else if compat & EXT3_COMPAT_HAS_JOURNAL != 0 {
        "ext3"
    } else {
        "ext2"
    };

    Some(Probe {
        offset: EXT_SUPERBLOCK_OFFSET as u64,
        confidence: Confidence::High,
        variant: Some(variant),
        evidence: vec![
            "superblock magic 0xEF53 at 0x438".to_string(),
            format!("{} blocks of {} bytes fit in {} byte file", blocks, block_size, file_len),
            format!("{} inodes, revision {}", inodes, rev_level),
        ],
    })
}

// ==== UBI / UBIFS ====

const UBI_EC_MAGIC: &[u8] = b"UBI#";
const UBIFS_NODE_MAGIC: [u8; 4] = [0x31, 0x18, 0x10, 0x06];
const UBIFS_SB_NODE: u8 = 6;

fn probe_ubi(buf: &[u8], file_len: u64) -> Option<Probe> {
    let magic = buf.get(0..4)?;

    if magic == UBI_EC_MAGIC {
        let version = *buf.get(4)?;
        let vid_hdr_offset = u64::from(Endian::Big.u32(buf, 16)?);
        let data_offset = u64::from(Endian::Big.u32(buf, 20)?);
        if version != 1 {
            return None;
        }
        if vid_hdr_offset == 0 || vid_hdr_offset >= data_offset || data_offset >= file_len {
            return None;
        }
        return Some(Probe {
            offset: 0,
            confidence: Confidence::High,
            variant: Some("ubi"),
            evidence: vec![
                "UBI erase counter header".to_string(),
                format!("VID header at {:#x}, data at {:#x}", vid_hdr_offset, data_offset),
            ],
        });
    }

    if magic == UBIFS_NODE_MAGIC {
        let node_len = u64::from(Endian::Little.u32(buf, 16)?);
        let node_type = *buf.get(20)?;
        if node_type != UBIFS_SB_NODE || node_len < 24 || node_len > file_len {
            return None;
        }
        return Some(Probe {
            offset: 0,
            confidence: Confidence::Medium,
            variant: Some("ubifs"),
            evidence: vec![
                "UBIFS node magic".to_string(),
                format!("superblock node of {} bytes", node_len),
            ],
        });
    }

    None
}

// ==== JFFS2 ====

const JFFS2_MAGIC: u16 = 0x1985;
const JFFS2_NODE_HEADER_LEN: u64 = 12;
const JFFS2_NODETYPES: [u16; 7] = [0xE001, 0xE002, 0x2003, 0x2004, 0x2006, 0xE008, 0xE009];

fn probe_jffs2(buf: &[u8], file_len: u64) -> Option<Probe> {
    let endian = match buf.get(0..2)? {
        [0x85, 0x19] => Endian::Little,
        [0x19, 0x85] => Endian::Big,
        _ => return None,
    };
    let nodetype = endian.u16(buf, 2)?;
    let totlen = u64::from(endian.u32(buf, 4)?);
    if !JFFS2_NODETYPES.contains(&nodetype) {
        return None;
    }
    if totlen < JFFS2_NODE_HEADER_LEN || totlen > file_len {
        return None;
    }

    let mut evidence = vec![
        format!("{} node magic", endian.label()),
        format!("node type {:#06x}, length {}", nodetype, totlen),
    ];

    // Nodes are 4-byte aligned; the next one is another node or erased flash
    let next = ((totlen + 3) & !3) as usize;
    let confidence = match endian.u16(buf, next) {
        Some(JFFS2_MAGIC) => {
            evidence.push(format!("second node at {:#x}", next));
            Confidence::High
        }
        Some(0xFFFF) | Some(0x0000) => Confidence::Medium,
        Some(_) => return None,
        None => Confidence::Medium,
    };

    Some(Probe {
        offset: 0,
        confidence,
        variant: None,
        evidence,
    })
}

// ==== YAFFS2 ====

const YAFFS_NAME_OFFSET: usize = 10;
const YAFFS_NAME_LEN: usize = 256;
/// Chunk plus out-of-band sizes used by common NAND geometries.
const YAFFS_CHUNK_STRIDES: [usize; 3] = [512 + 16, 2048 + 64, 4096 + 128];

fn probe_yaffs2(buf: &[u8], file_len: u64) -> Option<Probe> {
    if file_len < YAFFS_CHUNK_STRIDES[0] as u64 {
        return None;
    }

    [Endian::Little, Endian::Big].into_iter().find_map(|endian| {
        let name = yaffs_object_header(buf, 0, endian)?;
        // Images start with an entry of the root directory (object id 1)
        if endian.u32(buf, 4)? != 1 {
            return None;
        }

        let mut evidence = vec![
            format!("{} object header", endian.label()),
            format!("first object {:?} in root directory", name),
        ];
        let stride = YAFFS_CHUNK_STRIDES
            .iter()
            .copied()
            .find(|&stride| yaffs_object_header(buf, stride, endian).is_some());
        let confidence = match stride {
            Some(stride) => {
                evidence.push(format!("next object header at chunk stride {}", stride));
                Confidence::High
            }
            None => Confidence::Medium,
        };

        Some(Probe {
            offset: 0,
            confidence,
            variant: None,
            evidence,
        })
    })
}

fn yaffs_object_header(buf: &[u8], offset: usize, endian: Endian) -> Option<String> {
    let object_type = endian.u32(buf, offset)?;
    let parent = endian.u32(buf, offset + 4)?;
    let unused_sum = endian.u16(buf, offset + 8)?;
    if !(1..=5).contains(&object_type) || parent == 0 || unused_sum != 0xFFFF {
        return None;
    }

    let start = offset + YAFFS_NAME_OFFSET;
    let name = buf.get(start..start + YAFFS_NAME_LEN)?;
    let end = name.iter().position(|&b| b == 0)?;
    let name = &name[..end];
    if name.is_empty() || !name.iter().all(|&b| (0x20..0x7f).contains(&b) && b != b'/') {
        return None;
    }
    Some(String::from_utf8_lossy(name).into_owned())
}
