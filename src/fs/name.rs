//! Name codec: path segment parsing into short/long keys, long-name entry
//! packing, exFAT name entries, checksums and the CP437 code page.

use super::layout::*;
use crate::error::{FsError, FsResult};

// Segment status flags produced by `create_name`.
/// Short name was derived lossily.
pub const NS_LOSS: u8 = 0x01;
/// A long name must be stored.
pub const NS_LFN: u8 = 0x02;
/// Last segment of the path.
pub const NS_LAST: u8 = 0x04;
/// Body is all lower case (NT flag).
pub const NS_BODY: u8 = 0x08;
/// Extension is all lower case (NT flag).
pub const NS_EXT: u8 = 0x10;
/// "." or ".." segment.
pub const NS_DOT: u8 = 0x20;
/// Do not look for a long name while matching.
pub const NS_NOLFN: u8 = 0x40;
/// The path ended before any segment: the start directory itself.
pub const NS_NONAME: u8 = 0x80;

/// Attribute bits reported for exFAT objects.
pub const AM_MASKX: u8 = AM_RDO | AM_HID | AM_SYS | AM_DIR | AM_ARC;

pub fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// Map a CP437 byte to a Unicode character.
pub fn oem_to_char(b: u8) -> char {
    if b < 0x80 {
        b as char
    } else {
        CP437_HIGH[b as usize - 0x80]
    }
}

/// Map a Unicode character to CP437, if it has a representation.
pub fn char_to_oem(c: char) -> Option<u8> {
    if (c as u32) < 0x80 {
        return Some(c as u8);
    }
    CP437_HIGH
        .iter()
        .position(|&h| h == c)
        .map(|i| (i + 0x80) as u8)
}

/// Unicode simple upper-case mapping restricted to the BMP.
pub fn wtoupper(wc: u16) -> u16 {
    if wc < 0x80 {
        return (wc as u8).to_ascii_uppercase() as u16;
    }
    let Some(c) = char::from_u32(wc as u32) else {
        return wc;
    };
    let mut up = c.to_uppercase();
    match (up.next(), up.next()) {
        (Some(u), None) if (u as u32) <= 0xFFFF => u as u16,
        _ => wc,
    }
}

/// Checksum of a short name, stored in each of its long-name entries.
pub fn sum_sfn(sfn: &[u8]) -> u8 {
    sfn[..11]
        .iter()
        .fold(0u8, |sum, &b| (sum >> 1).wrapping_add(sum << 7).wrapping_add(b))
}

/// Checksum of an exFAT entry-set, skipping the checksum field itself.
pub fn xdir_sum(set: &[u8]) -> u16 {
    let len = (set[XDIR_NUM_SEC] as usize + 1) * SZDIRE;
    set[..len]
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != XDIR_SET_SUM && *i != XDIR_SET_SUM + 1)
        .fold(0u16, |sum, (_, &b)| sum.rotate_right(1).wrapping_add(b as u16))
}

/// exFAT name hash over the up-cased name.
pub fn xname_sum(name: &[u16]) -> u16 {
    let mut sum = 0u16;
    for &wc in name.iter().take_while(|&&c| c != 0) {
        let up = wtoupper(wc);
        sum = sum.rotate_right(1).wrapping_add(up & 0xFF);
        sum = sum.rotate_right(1).wrapping_add(up >> 8);
    }
    sum
}

/// Length of a 0-terminated UTF-16 buffer.
pub fn wlen(buf: &[u16]) -> usize {
    buf.iter().position(|&c| c == 0).unwrap_or(buf.len())
}

/// Parse the next segment of `path` into `lfn` (0-terminated UTF-16) and
/// `sfn` (space padded 8.3 directory form).
///
/// Returns the segment status flags and the remainder of the path.
pub fn create_name<'p>(
    path: &'p str,
    lfn: &mut [u16],
    sfn: &mut [u8; 11],
) -> FsResult<(u8, &'p str)> {
    let mut di = 0usize;
    let mut rest = "";
    let mut at_separator = false;

    for (pos, c) in path.char_indices() {
        if (c as u32) < 0x20 {
            rest = "";
            break;
        }
        if is_separator(c) {
            rest = &path[pos + c.len_utf8()..];
            at_separator = true;
            break;
        }
        if "*:<>|\"?\x7F".contains(c) {
            return Err(FsError::InvalidName);
        }
        let mut units = [0u16; 2];
        for &u in c.encode_utf16(&mut units).iter() {
            if di >= MAX_LFN_CHARS {
                return Err(FsError::InvalidName);
            }
            lfn[di] = u;
            di += 1;
        }
    }

    let mut cf = if at_separator {
        rest = rest.trim_start_matches(is_separator);
        if rest.is_empty() || rest.starts_with(|c: char| (c as u32) < 0x20) {
            NS_LAST
        } else {
            0
        }
    } else {
        NS_LAST
    };

    let dot = b'.' as u16;
    if (di == 1 && lfn[0] == dot) || (di == 2 && lfn[0] == dot && lfn[1] == dot) {
        lfn[di] = 0;
        for (i, b) in sfn.iter_mut().enumerate() {
            *b = if i < di { b'.' } else { b' ' };
        }
        return Ok((cf | NS_DOT, rest));
    }

    while di > 0 && (lfn[di - 1] == b' ' as u16 || lfn[di - 1] == dot) {
        di -= 1;
    }
    lfn[di] = 0;
    if di == 0 {
        return Err(FsError::InvalidName);
    }

    let mut si = 0usize;
    while lfn[si] == b' ' as u16 {
        si += 1;
    }
    if si > 0 || lfn[si] == dot {
        cf |= NS_LOSS | NS_LFN;
    }
    // Position just past the last dot; `di <= si` means no extension.
    while di > 0 && lfn[di - 1] != dot {
        di -= 1;
    }

    sfn.fill(b' ');
    let (mut i, mut ni, mut b) = (0usize, 8usize, 0u8);
    loop {
        let wc = lfn[si];
        si += 1;
        if wc == 0 {
            break;
        }
        if wc == b' ' as u16 || (wc == dot && si != di) {
            cf |= NS_LOSS | NS_LFN;
            continue;
        }
        if i >= ni || si == di {
            if ni == 11 {
                cf |= NS_LOSS | NS_LFN;
                break;
            }
            if si != di {
                cf |= NS_LOSS | NS_LFN;
            }
            if si > di {
                break;
            }
            si = di;
            i = 8;
            ni = 11;
            b <<= 2;
            continue;
        }

        let mut code = if wc >= 0x80 {
            cf |= NS_LFN;
            char::from_u32(wtoupper(wc) as u32)
                .and_then(char_to_oem)
                .unwrap_or(0)
        } else {
            wc as u8
        };
        if code == 0 || b"+,;=[]".contains(&code) {
            code = b'_';
            cf |= NS_LOSS | NS_LFN;
        } else if code.is_ascii_uppercase() {
            b |= 2;
        } else if code.is_ascii_lowercase() {
            b |= 1;
            code -= 0x20;
        }
        sfn[i] = code;
        i += 1;
    }

    if sfn[0] == DDEM {
        sfn[0] = RDDEM;
    }
    if ni == 8 {
        b <<= 2;
    }
    if b & 0x0C == 0x0C || b & 0x03 == 0x03 {
        cf |= NS_LFN;
    }
    if cf & NS_LFN == 0 {
        if b & 0x01 != 0 {
            cf |= NS_EXT;
        }
        if b & 0x04 != 0 {
            cf |= NS_BODY;
        }
    }
    Ok((cf, rest))
}

/// Does long-name entry `ent` match its part of the name in `lfn`?
pub fn cmp_lfn(lfn: &[u16], ent: &[u8]) -> bool {
    if ld16(ent, LDIR_FST_CLUS_LO) != 0 {
        return false;
    }
    let ord = (ent[LDIR_ORD] & 0x3F) as usize;
    if ord == 0 {
        return false;
    }
    let mut i = (ord - 1) * 13;
    let mut wc = 1u16;
    for &ofs in LFN_OFFSETS.iter() {
        let uc = ld16(ent, ofs);
        if wc != 0 {
            let want = lfn.get(i).copied().unwrap_or(0);
            if i > MAX_LFN_CHARS || wtoupper(uc) != wtoupper(want) {
                return false;
            }
            i += 1;
            wc = uc;
        } else if uc != 0xFFFF {
            return false;
        }
    }
    !(ent[LDIR_ORD] & LLEF != 0 && wc != 0 && lfn.get(i).is_some_and(|&c| c != 0))
}

/// Copy the name part held by long-name entry `ent` into `lfn`.
pub fn pick_lfn(lfn: &mut [u16], ent: &[u8]) -> bool {
    if ld16(ent, LDIR_FST_CLUS_LO) != 0 {
        return false;
    }
    let ord = (ent[LDIR_ORD] & !LLEF) as usize;
    if ord == 0 {
        return false;
    }
    let mut i = (ord - 1) * 13;
    let mut wc = 1u16;
    for &ofs in LFN_OFFSETS.iter() {
        let uc = ld16(ent, ofs);
        if wc != 0 {
            if i > MAX_LFN_CHARS {
                return false;
            }
            lfn[i] = uc;
            wc = uc;
            i += 1;
        } else if uc != 0xFFFF {
            return false;
        }
    }
    if ent[LDIR_ORD] & LLEF != 0 && wc != 0 {
        if i > MAX_LFN_CHARS {
            return false;
        }
        lfn[i] = 0;
    }
    true
}

/// Fill long-name entry `ent` with part `ord` (1-based) of `lfn`.
pub fn put_lfn(lfn: &[u16], ent: &mut [u8], ord: u8, sum: u8) {
    ent[LDIR_CHKSUM] = sum;
    ent[LDIR_ATTR] = AM_LFN;
    ent[LDIR_TYPE] = 0;
    st16(ent, LDIR_FST_CLUS_LO, 0);
    let mut i = (ord as usize - 1) * 13;
    let mut wc = 0u16;
    for &ofs in LFN_OFFSETS.iter() {
        if wc != 0xFFFF {
            wc = lfn[i];
            i += 1;
        }
        st16(ent, ofs, wc);
        if wc == 0 {
            wc = 0xFFFF;
        }
    }
    let last = wc == 0xFFFF || lfn[i] == 0;
    ent[LDIR_ORD] = if last { ord | LLEF } else { ord };
}

/// Derive the numbered short name `src` + `~N` used to dodge a collision.
/// After five sequential attempts the number is hashed from the long name.
pub fn gen_numname(dst: &mut [u8; 11], src: &[u8; 11], lfn: &[u16], seq: u32) {
    dst.copy_from_slice(src);
    let mut seq = seq;
    if seq > 5 {
        let mut sreg = seq;
        for &c in lfn.iter().take_while(|&&c| c != 0) {
            let mut wc = c;
            for _ in 0..16 {
                sreg = (sreg << 1) + (wc & 1) as u32;
                wc >>= 1;
                if sreg & 0x10000 != 0 {
                    sreg ^= 0x11021;
                }
            }
        }
        seq = sreg;
    }

    let mut ns = [0u8; 8];
    let mut i = 7;
    loop {
        let mut c = (seq % 16) as u8 + b'0';
        seq /= 16;
        if c > b'9' {
            c += 7;
        }
        ns[i] = c;
        i -= 1;
        if i == 0 || seq == 0 {
            break;
        }
    }
    ns[i] = b'~';

    let mut j = 0;
    while j < i && dst[j] != b' ' {
        j += 1;
    }
    while j < 8 {
        dst[j] = if i < 8 {
            let c = ns[i];
            i += 1;
            c
        } else {
            b' '
        };
        j += 1;
    }
}

/// Short name of an entry as "NAME.EXT".
pub fn sfn_to_string(ent: &[u8]) -> String {
    let mut out = String::with_capacity(12);
    for (si, &b) in ent[..11].iter().enumerate() {
        if b == b' ' {
            continue;
        }
        let b = if b == RDDEM { DDEM } else { b };
        if si == 8 {
            out.push('.');
        }
        out.push(oem_to_char(b));
    }
    out
}

/// Short name with the NT lower-case flags applied, used as the display
/// name when no long name exists.
pub fn sfn_display_name(ent: &[u8]) -> String {
    let nt = ent[DIR_NTRES];
    let mut lcf = NS_BODY;
    sfn_to_string(ent)
        .chars()
        .map(|c| {
            if c == '.' {
                lcf = NS_EXT;
            }
            if c.is_ascii_uppercase() && nt & lcf != 0 {
                c.to_ascii_lowercase()
            } else {
                c
            }
        })
        .collect()
}

/// Decode a 0-terminated UTF-16 buffer. `None` on unpaired surrogates.
pub fn utf16_to_string(buf: &[u16]) -> Option<String> {
    String::from_utf16(&buf[..wlen(buf)]).ok()
}

/// Build the file, stream-extension and file-name entries of a new
/// entry-set for `lfn` into `set`.
pub fn create_xdir(set: &mut [u8], lfn: &[u16]) {
    set[..2 * SZDIRE].fill(0);
    set[XDIR_TYPE] = ET_FILEDIR;
    set[SZDIRE + XDIR_TYPE] = ET_STREAM;

    let len = wlen(lfn);
    let mut i = 2 * SZDIRE;
    let mut nlen = 0usize;
    let mut nc1 = 0u8;
    let mut wc = 1u16;
    loop {
        set[i] = ET_FILENAME;
        set[i + 1] = 0;
        i += 2;
        while i % SZDIRE != 0 {
            if wc != 0 {
                wc = if nlen < len { lfn[nlen] } else { 0 };
                if wc != 0 {
                    nlen += 1;
                }
            }
            st16(set, i, wc);
            i += 2;
        }
        nc1 += 1;
        if nlen >= len {
            break;
        }
    }
    set[XDIR_NUM_NAME] = nlen as u8;
    set[XDIR_NUM_SEC] = 1 + nc1;
    st16(set, XDIR_NAME_HASH, xname_sum(lfn));
}

/// Decode the name carried by the file-name entries of an entry-set.
pub fn xdir_name(set: &[u8]) -> Option<String> {
    let nc = set[XDIR_NUM_NAME] as usize;
    let mut units = Vec::with_capacity(nc);
    let mut si = 2 * SZDIRE;
    while units.len() < nc {
        if si >= set.len() {
            return None;
        }
        if si % SZDIRE == 0 {
            si += 2;
        }
        units.push(ld16(set, si));
        si += 2;
    }
    String::from_utf16(&units).ok()
}

/// Case-insensitive glob match supporting `?` and `*`.
pub fn pattern_match(pattern: &str, name: &str) -> bool {
    let pat: Vec<char> = pattern.chars().flat_map(char::to_uppercase).collect();
    let nam: Vec<char> = name.chars().flat_map(char::to_uppercase).collect();
    let (mut p, mut n) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while n < nam.len() {
        match pat.get(p) {
            Some('*') => {
                star = Some((p, n));
                p += 1;
            }
            Some(&c) if c == '?' || c == nam[n] => {
                p += 1;
                n += 1;
            }
            _ => match star {
                Some((sp, sn)) => {
                    p = sp + 1;
                    n = sn + 1;
                    star = Some((sp, sn + 1));
                }
                None => return false,
            },
        }
    }
    pat[p..].iter().all(|&c| c == '*')
}

/// CP437 to Unicode mapping for bytes 0x80-0xFF.
#[rustfmt::skip]
const CP437_HIGH: [char; 128] = [
    // 0x80-0x8F
    'Ç','ü','é','â','ä','à','å','ç', 'ê','ë','è','ï','î','ì','Ä','Å',
    // 0x90-0x9F
    'É','æ','Æ','ô','ö','ò','û','ù', 'ÿ','Ö','Ü','¢','£','¥','₧','ƒ',
    // 0xA0-0xAF
    'á','í','ó','ú','ñ','Ñ','ª','º', '¿','⌐','¬','½','¼','¡','«','»',
    // 0xB0-0xBF
    '░','▒','▓','│','┤','╡','╢','╖', '╕','╣','║','╗','╝','╜','╛','┐',
    // 0xC0-0xCF
    '└','┴','┬','├','─','┼','╞','╟', '╚','╔','╩','╦','╠','═','╬','╧',
    // 0xD0-0xDF
    '╨','╤','╥','╙','╘','╒','╓','╫', '╪','┘','┌','█','▄','▌','▐','▀',
    // 0xE0-0xEF
    'α','ß','Γ','π','Σ','σ','µ','τ', 'Φ','Θ','Ω','δ','∞','φ','ε','∩',
    // 0xF0-0xFF
    '≡','±','≥','≤','⌠','⌡','÷','≈', '°','∙','·','√','ⁿ','²','■','\u{00A0}',
];
