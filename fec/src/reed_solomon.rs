//! Systematic Reed-Solomon encoder over GF(2^8) with primitive polynomial
//! 0x11D, as used by DAB+ audio superframes (RS(120,110), ETSI TS 102 563),
//! enhanced packet mode (RS(204,188)) and EDI PFT (RS(255,207), ETSI
//! TS 102 821). The generator polynomial is g(x) = prod_{i=0}^{nroots-1}
//! (x - alpha^i), i.e. first consecutive root alpha^0.
//!
//! Erasure-only correction is also provided; the multiplexer itself never
//! decodes, but the PFT reconstruction path (and its tests) does.

use failure::{bail, Error};

const NN: usize = 255;
const GFPOLY: u32 = 0x11D;
/// Sentinel for log(0) in the index table.
const A0: u8 = 255;

#[derive(Debug)]
pub struct ReedSolomon {
    n: usize,
    k: usize,
    nroots: usize,
    alpha_to: [u8; 256],
    index_of: [u8; 256],
    /// Generator polynomial in index (log) form, genpoly[nroots] is the
    /// leading coefficient.
    genpoly: Vec<u8>,
}

impl ReedSolomon {
    /// Creates an RS(n, k) encoder. `n` is the codeword length in symbols,
    /// `k` the number of information symbols.
    pub fn new(n: usize, k: usize) -> Result<Self, Error> {
        if n > NN {
            bail!("RS n={} must be <= {}", n, NN);
        }
        if k == 0 || k >= n {
            bail!("RS k={} must be in 1..n={}", k, n);
        }
        let nroots = n - k;

        // Antilog/log tables for GF(2^8).
        let mut alpha_to = [0u8; 256];
        let mut index_of = [0u8; 256];
        let mut v: u32 = 1;
        for i in 0..NN {
            alpha_to[i] = v as u8;
            v <<= 1;
            if v & 0x100 != 0 {
                v ^= GFPOLY;
            }
        }
        alpha_to[NN] = 0;
        index_of[0] = A0;
        for i in 0..NN {
            index_of[alpha_to[i] as usize] = i as u8;
        }

        // Generator polynomial, built in polynomial form then converted to
        // index form for the encoder loop.
        let mut gen = vec![0u8; nroots + 1];
        gen[0] = 1;
        for i in 0..nroots {
            gen[i + 1] = 1;
            for j in (1..=i).rev() {
                if gen[j] != 0 {
                    let idx = modnn(usize::from(index_of[gen[j] as usize]) + i);
                    gen[j] = gen[j - 1] ^ alpha_to[idx];
                } else {
                    gen[j] = gen[j - 1];
                }
            }
            let idx = modnn(usize::from(index_of[gen[0] as usize]) + i);
            gen[0] = alpha_to[idx];
        }
        let genpoly = gen.iter().map(|&c| index_of[c as usize]).collect();

        Ok(ReedSolomon {
            n,
            k,
            nroots,
            alpha_to,
            index_of,
            genpoly,
        })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn parity_len(&self) -> usize {
        self.nroots
    }

    /// Computes the `n - k` parity symbols for `data` (length must be `k`).
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        if data.len() != self.k {
            bail!("RS encode: data length {} != k={}", data.len(), self.k);
        }
        let mut parity = vec![0u8; self.nroots];
        for &d in data {
            let feedback = self.index_of[(d ^ parity[0]) as usize];
            if feedback != A0 {
                for j in 1..self.nroots {
                    let g = self.genpoly[self.nroots - j];
                    if g != A0 {
                        parity[j] ^=
                            self.alpha_to[modnn(usize::from(feedback) + usize::from(g))];
                    }
                }
            }
            parity.copy_within(1.., 0);
            parity[self.nroots - 1] = if feedback != A0 {
                self.alpha_to[modnn(usize::from(feedback) + usize::from(self.genpoly[0]))]
            } else {
                0
            };
        }
        Ok(parity)
    }

    /// Returns the full systematic codeword: `data` followed by parity.
    pub fn encode_block(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut block = Vec::with_capacity(self.n);
        block.extend_from_slice(data);
        block.extend_from_slice(&self.encode(data)?);
        Ok(block)
    }

    /// Corrects up to `n - k` erasures in place. `block` must be a full
    /// codeword (length `n`); `erasures` lists the byte positions whose
    /// values are unknown (their current contents are ignored).
    pub fn correct_erasures(&self, block: &mut [u8], erasures: &[usize]) -> Result<(), Error> {
        if block.len() != self.n {
            bail!("RS correct: block length {} != n={}", block.len(), self.n);
        }
        if erasures.len() > self.nroots {
            bail!(
                "RS correct: {} erasures exceed correction capacity {}",
                erasures.len(),
                self.nroots
            );
        }
        for &pos in erasures {
            if pos >= self.n {
                bail!("RS correct: erasure position {} out of range", pos);
            }
        }

        let synd = self.syndromes(block);
        if synd.iter().all(|&s| s == 0) {
            return Ok(());
        }
        if erasures.is_empty() {
            bail!("RS correct: nonzero syndromes but no erasure positions");
        }

        // With t known erasure locations X_j = alpha^(n-1-pos_j) the first t
        // syndromes give a Vandermonde system sum_j e_j * X_j^i = S_i,
        // solved directly by elimination over GF(2^8).
        let t = erasures.len();
        let mut m = vec![vec![0u8; t + 1]; t];
        for (i, row) in m.iter_mut().enumerate() {
            for (j, &pos) in erasures.iter().enumerate() {
                let loc = (self.n - 1 - pos) % NN;
                row[j] = self.alpha_pow(loc * i);
            }
            row[t] = synd[i];
        }
        let magnitudes = self.solve(&mut m)?;
        for (j, &pos) in erasures.iter().enumerate() {
            block[pos] ^= magnitudes[j];
        }

        if self.syndromes(block).iter().any(|&s| s != 0) {
            bail!("RS correct: syndromes nonzero after erasure correction");
        }
        Ok(())
    }

    /// Evaluates the received polynomial at alpha^0 .. alpha^(nroots-1).
    fn syndromes(&self, block: &[u8]) -> Vec<u8> {
        (0..self.nroots)
            .map(|i| {
                let mut acc = 0u8;
                for &b in block {
                    acc = self.mul(acc, self.alpha_pow(i)) ^ b;
                }
                acc
            })
            .collect()
    }

    /// Gaussian elimination over GF(2^8) on an augmented t x (t+1) matrix.
    fn solve(&self, m: &mut [Vec<u8>]) -> Result<Vec<u8>, Error> {
        let t = m.len();
        for col in 0..t {
            let pivot = (col..t)
                .find(|&r| m[r][col] != 0)
                .ok_or_else(|| failure::format_err!("RS correct: singular erasure system"))?;
            m.swap(col, pivot);
            let inv = self.inv(m[col][col]);
            for x in m[col].iter_mut() {
                *x = self.mul(*x, inv);
            }
            for row in 0..t {
                if row != col && m[row][col] != 0 {
                    let factor = m[row][col];
                    for c in 0..=t {
                        let sub = self.mul(factor, m[col][c]);
                        m[row][c] ^= sub;
                    }
                }
            }
        }
        Ok(m.iter().map(|row| row[t]).collect())
    }

    fn alpha_pow(&self, e: usize) -> u8 {
        self.alpha_to[e % NN]
    }

    fn mul(&self, a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            return 0;
        }
        let idx = modnn(
            usize::from(self.index_of[a as usize]) + usize::from(self.index_of[b as usize]),
        );
        self.alpha_to[idx]
    }

    fn inv(&self, a: u8) -> u8 {
        let log = usize::from(self.index_of[a as usize]);
        self.alpha_to[(NN - log) % NN]
    }
}

fn modnn(mut x: usize) -> usize {
    while x >= NN {
        x -= NN;
    }
    x
}
