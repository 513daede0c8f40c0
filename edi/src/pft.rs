//! PFT — Protection, Fragmentation and Transport (ETSI TS 102 821):
//! splits AF packets into PF fragments for lossy links, optionally with
//! RS(255,207) erasure coding and column-major interleaving so that any
//! F - M fragments recover the packet.

use bytes::BufMut;
use failure::{bail, Error};
use fec::ReedSolomon;

/// RS code used for PFT.
const RS_N: usize = 255;
const RS_K: usize = 207;
const RS_P: usize = RS_N - RS_K;

#[derive(Clone, Debug)]
pub struct PftConfig {
    pub fec: bool,
    /// Recoverable fragments, 0..=5.
    pub fec_m: u8,
    pub max_fragment_size: usize,
    pub addr: bool,
    pub source_addr: u16,
    pub dest_addr: u16,
}

impl Default for PftConfig {
    fn default() -> Self {
        PftConfig {
            fec: false,
            fec_m: 0,
            max_fragment_size: 1400,
            addr: false,
            source_addr: 0,
            dest_addr: 0,
        }
    }
}

/// One PF packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PfFragment {
    pub pseq: u16,
    pub findex: u32,
    pub fcount: u32,
    pub fec: bool,
    pub addr: bool,
    pub source: u16,
    pub dest: u16,
    /// RS chunk length (data part), when FEC is on.
    pub rs_k: u8,
    /// Zero padding appended to the AF packet, when FEC is on.
    pub rs_z: u8,
    pub payload: Vec<u8>,
}

impl PfFragment {
    /// Wire encoding: header, header CRC, payload.
    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.payload.len());
        out.extend_from_slice(b"PF");
        out.put_u16(self.pseq);
        out.put_u8((self.findex >> 16) as u8);
        out.put_u8((self.findex >> 8) as u8);
        out.put_u8(self.findex as u8);
        out.put_u8((self.fcount >> 16) as u8);
        out.put_u8((self.fcount >> 8) as u8);
        out.put_u8(self.fcount as u8);
        let mut plen = (self.payload.len() as u16) & 0x3FFF;
        if self.fec {
            plen |= 0x8000;
        }
        if self.addr {
            plen |= 0x4000;
        }
        out.put_u16(plen);
        if self.fec {
            out.put_u8(self.rs_k);
            out.put_u8(self.rs_z);
        }
        if self.addr {
            out.put_u16(self.source);
            out.put_u16(self.dest);
        }
        let crc = fec::crc16(&out);
        out.put_u16(crc);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parses and CRC-checks one PF packet.
    pub fn parse(data: &[u8]) -> Result<PfFragment, Error> {
        if data.len() < 14 {
            bail!("PF packet too short: {} bytes", data.len());
        }
        if &data[0..2] != b"PF" {
            bail!("bad PF sync");
        }
        let pseq = u16::from_be_bytes([data[2], data[3]]);
        let findex = (u32::from(data[4]) << 16) | (u32::from(data[5]) << 8) | u32::from(data[6]);
        let fcount = (u32::from(data[7]) << 16) | (u32::from(data[8]) << 8) | u32::from(data[9]);
        let plen = u16::from_be_bytes([data[10], data[11]]);
        let fec_flag = plen & 0x8000 != 0;
        let addr_flag = plen & 0x4000 != 0;
        let payload_len = usize::from(plen & 0x3FFF);

        let mut off = 12;
        let (mut rs_k, mut rs_z) = (0u8, 0u8);
        if fec_flag {
            if data.len() < off + 2 {
                bail!("PF header truncated (RS fields)");
            }
            rs_k = data[off];
            rs_z = data[off + 1];
            off += 2;
        }
        let (mut source, mut dest) = (0u16, 0u16);
        if addr_flag {
            if data.len() < off + 4 {
                bail!("PF header truncated (addresses)");
            }
            source = u16::from_be_bytes([data[off], data[off + 1]]);
            dest = u16::from_be_bytes([data[off + 2], data[off + 3]]);
            off += 4;
        }
        if data.len() < off + 2 + payload_len {
            bail!("PF packet truncated");
        }
        let stored = u16::from_be_bytes([data[off], data[off + 1]]);
        let computed = fec::crc16(&data[..off]);
        if stored != computed {
            bail!("PF header CRC mismatch");
        }
        off += 2;
        Ok(PfFragment {
            pseq,
            findex,
            fcount,
            fec: fec_flag,
            addr: addr_flag,
            source,
            dest,
            rs_k,
            rs_z,
            payload: data[off..off + payload_len].to_vec(),
        })
    }
}

pub struct PftFragmenter {
    config: PftConfig,
    pseq: u16,
    rs: ReedSolomon,
}

impl PftFragmenter {
    pub fn new(config: PftConfig) -> Result<Self, Error> {
        if config.fec && config.fec_m > 5 {
            bail!("PFT FEC m={} out of range 0..5", config.fec_m);
        }
        if config.max_fragment_size == 0 {
            bail!("PFT fragment size must be nonzero");
        }
        Ok(PftFragmenter {
            config,
            pseq: 0,
            rs: ReedSolomon::new(RS_N, RS_K)?,
        })
    }

    /// Splits one AF packet; every produced fragment shares one PSeq.
    pub fn fragment(&mut self, af: &[u8]) -> Result<Vec<PfFragment>, Error> {
        let fragments = if self.config.fec {
            self.fragment_fec(af)?
        } else {
            self.fragment_plain(af)
        };
        self.pseq = self.pseq.wrapping_add(1);
        Ok(fragments)
    }

    fn fragment_plain(&self, af: &[u8]) -> Vec<PfFragment> {
        let chunk = self.config.max_fragment_size;
        let count = (af.len() + chunk - 1) / chunk;
        (0..count)
            .map(|i| {
                let start = i * chunk;
                let end = (start + chunk).min(af.len());
                PfFragment {
                    pseq: self.pseq,
                    findex: i as u32,
                    fcount: count as u32,
                    fec: false,
                    addr: self.config.addr,
                    source: self.config.source_addr,
                    dest: self.config.dest_addr,
                    rs_k: 0,
                    rs_z: 0,
                    payload: af[start..end].to_vec(),
                }
            })
            .collect()
    }

    fn fragment_fec(&self, af: &[u8]) -> Result<Vec<PfFragment>, Error> {
        // Partition into chunks of chunk_len <= 207, zero padded to the
        // chunk grid.
        let chunk_count = (af.len() + RS_K - 1) / RS_K;
        let chunk_len = (af.len() + chunk_count - 1) / chunk_count;
        let zero_pad = chunk_count * chunk_len - af.len();
        let mut padded = af.to_vec();
        padded.resize(chunk_count * chunk_len, 0);

        // Each encoded chunk is its data bytes followed by 48 parity
        // bytes over the 207-byte (zero-extended) codeword.
        let mut rs_block = Vec::with_capacity(chunk_count * (chunk_len + RS_P));
        for chunk in padded.chunks(chunk_len) {
            let mut codeword_data = chunk.to_vec();
            codeword_data.resize(RS_K, 0);
            let parity = self.rs.encode(&codeword_data)?;
            rs_block.extend_from_slice(chunk);
            rs_block.extend_from_slice(&parity);
        }

        // Fragment count follows from how many losses must stay
        // recoverable.
        let m = usize::from(self.config.fec_m);
        let s_max = if m > 0 {
            (chunk_count * RS_P) / (m + 1)
        } else {
            self.config.max_fragment_size
        };
        if s_max == 0 {
            bail!("PFT FEC m={} too large for {} chunk(s)", m, chunk_count);
        }
        let count = (rs_block.len() + s_max - 1) / s_max;
        let fragment_size = (rs_block.len() + count - 1) / count;

        // Column-major interleave: fragment i takes bytes j*count + i.
        let fragments = (0..count)
            .map(|i| {
                let mut payload = Vec::with_capacity(fragment_size);
                for j in 0..fragment_size {
                    let idx = j * count + i;
                    if idx < rs_block.len() {
                        payload.push(rs_block[idx]);
                    }
                }
                PfFragment {
                    pseq: self.pseq,
                    findex: i as u32,
                    fcount: count as u32,
                    fec: true,
                    addr: self.config.addr,
                    source: self.config.source_addr,
                    dest: self.config.dest_addr,
                    rs_k: chunk_len as u8,
                    rs_z: zero_pad as u8,
                    payload,
                }
            })
            .collect();
        Ok(fragments)
    }
}

/// Reassembles a plain (non-FEC) fragment set; requires all fragments.
pub fn reassemble(fragments: &[PfFragment]) -> Result<Vec<u8>, Error> {
    if fragments.is_empty() {
        bail!("no fragments");
    }
    let fcount = fragments[0].fcount as usize;
    let pseq = fragments[0].pseq;
    if fragments.iter().any(|f| f.pseq != pseq) {
        bail!("fragments from different PFT sequences");
    }
    if fragments[0].fec {
        return reassemble_fec(fragments);
    }
    let mut ordered: Vec<Option<&PfFragment>> = vec![None; fcount];
    for f in fragments {
        if f.findex as usize >= fcount {
            bail!("fragment index {} out of range", f.findex);
        }
        ordered[f.findex as usize] = Some(f);
    }
    let mut af = Vec::new();
    for slot in ordered {
        match slot {
            Some(f) => af.extend_from_slice(&f.payload),
            None => bail!("missing fragment without FEC"),
        }
    }
    Ok(af)
}

/// Recovers the AF packet from an incomplete FEC fragment set: any
/// F - M fragments suffice.
pub fn reassemble_fec(fragments: &[PfFragment]) -> Result<Vec<u8>, Error> {
    let first = fragments.first().ok_or_else(|| failure::format_err!("no fragments"))?;
    let fcount = first.fcount as usize;
    let chunk_len = usize::from(first.rs_k);
    let zero_pad = usize::from(first.rs_z);
    if chunk_len == 0 {
        bail!("FEC fragment without RSk");
    }

    // The RS block length is a multiple of (chunk_len + parity); find
    // the chunk count consistent with the observed fragment lengths
    // (fragment i holds ceil((L - i) / F) bytes).
    let per_chunk = chunk_len + RS_P;
    let mut block_len = None;
    'candidates: for c in 1..=RS_N {
        let l = c * per_chunk;
        for f in fragments {
            let i = f.findex as usize;
            let expect = if l > i { (l - i + fcount - 1) / fcount } else { 0 };
            if expect != f.payload.len() {
                continue 'candidates;
            }
        }
        block_len = Some(l);
        break;
    }
    let block_len = block_len
        .ok_or_else(|| failure::format_err!("inconsistent FEC fragment lengths"))?;
    let chunk_count = block_len / per_chunk;

    // De-interleave what arrived.
    let mut block: Vec<Option<u8>> = vec![None; block_len];
    for f in fragments {
        let i = f.findex as usize;
        for (j, &b) in f.payload.iter().enumerate() {
            let idx = j * fcount + i;
            if idx < block_len {
                block[idx] = Some(b);
            }
        }
    }

    // Erasure-correct chunk by chunk over the full 255-byte codeword
    // view (data, zero extension, parity).
    let rs = ReedSolomon::new(RS_N, RS_K)?;
    let mut af = Vec::with_capacity(chunk_count * chunk_len);
    for c in 0..chunk_count {
        let base = c * per_chunk;
        let mut codeword = [0u8; RS_N];
        let mut erasures = Vec::new();
        for k in 0..chunk_len {
            match block[base + k] {
                Some(b) => codeword[k] = b,
                None => erasures.push(k),
            }
        }
        for p in 0..RS_P {
            match block[base + chunk_len + p] {
                Some(b) => codeword[RS_K + p] = b,
                None => erasures.push(RS_K + p),
            }
        }
        rs.correct_erasures(&mut codeword, &erasures)?;
        af.extend_from_slice(&codeword[..chunk_len]);
    }
    af.truncate(af.len() - zero_pad);
    Ok(af)
}
