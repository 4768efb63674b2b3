//! Classic container byte codec.
//!
//! Serializes the in-memory file model to the classic self-describing
//! array format and parses it back. Three flavours share one layout:
//! v1 (`CDF\x01`, 32-bit offsets), v2 (`CDF\x02`, 64-bit offsets) and v5
//! (`CDF\x05`, 64-bit counts and sizes throughout). All header and data
//! words are big-endian; names and attribute/data blocks pad to 4-byte
//! boundaries.

use pario_core::PioType;
use pario_core::error::{PioError, Result};

const TAG_DIMENSION: u32 = 0x0A;
const TAG_VARIABLE: u32 = 0x0B;
const TAG_ATTRIBUTE: u32 = 0x0C;

/// One attribute: stored type plus native-endian element bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Att {
    pub name: String,
    pub xtype: PioType,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dim {
    pub name: String,
    /// 0 marks the record dimension.
    pub len: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Var {
    pub name: String,
    pub xtype: PioType,
    pub dimids: Vec<i32>,
    pub atts: Vec<Att>,
    /// Explicit fill value (native element bytes) or `None` for the type
    /// default.
    pub fill: Option<Vec<u8>>,
    pub no_fill: bool,
    /// Native-endian elements in row-major order; record variables hold
    /// `numrecs` full records.
    pub data: Vec<u8>,
}

/// In-memory image of one classic container file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Model {
    /// Format flavour: 1, 2 or 5.
    pub version: u8,
    pub dims: Vec<Dim>,
    pub gatts: Vec<Att>,
    pub vars: Vec<Var>,
    pub numrecs: i64,
}

impl Model {
    pub fn new(version: u8) -> Model {
        Model {
            version,
            ..Default::default()
        }
    }

    pub fn is_rec_var(&self, var: &Var) -> bool {
        var.dimids
            .first()
            .is_some_and(|&d| self.dims[d as usize].len == 0)
    }

    /// Elements in one record of a record variable, or the whole variable
    /// if fixed.
    pub fn rec_elems(&self, var: &Var) -> i64 {
        let skip = if self.is_rec_var(var) { 1 } else { 0 };
        var.dimids[skip..]
            .iter()
            .map(|&d| self.dims[d as usize].len)
            .product::<i64>()
            .max(1)
    }

    fn fill_elem(var: &Var) -> Vec<u8> {
        match &var.fill {
            Some(f) => f.clone(),
            None => var.xtype.default_fill().unwrap_or_default(),
        }
    }

    /// Current element shape of a variable, record dimension resolved to
    /// `numrecs`.
    pub fn shape(&self, var: &Var) -> Vec<i64> {
        var.dimids
            .iter()
            .map(|&d| {
                let len = self.dims[d as usize].len;
                if len == 0 { self.numrecs } else { len }
            })
            .collect()
    }

    /// Ensure backing storage covers the variable's current shape,
    /// extending with the fill value.
    pub fn reserve(&mut self, varid: usize) {
        let var = &self.vars[varid];
        let esize = var.xtype.disk_size().unwrap();
        let total: i64 = self.shape(var).iter().product::<i64>().max(1);
        let want = total as usize * esize;
        if self.vars[varid].data.len() < want {
            let fill = Self::fill_elem(&self.vars[varid]);
            let var = &mut self.vars[varid];
            while var.data.len() < want {
                var.data.extend_from_slice(&fill);
            }
        }
    }

    /// Grow the record count; every record variable is padded out.
    pub fn grow_records(&mut self, numrecs: i64) {
        if numrecs <= self.numrecs {
            return;
        }
        self.numrecs = numrecs;
        for v in 0..self.vars.len() {
            if self.is_rec_var(&self.vars[v]) {
                self.reserve(v);
            }
        }
    }
}

// --- Big-endian element conversion ----------------------------------------

/// Convert native-endian elements to big-endian (or back; the swap is an
/// involution).
pub fn swap_elements(data: &[u8], xtype: PioType) -> Vec<u8> {
    let esize = xtype.disk_size().unwrap_or(1);
    if esize == 1 || cfg!(target_endian = "big") {
        return data.to_vec();
    }
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks_exact(esize) {
        out.extend(chunk.iter().rev());
    }
    out
}

fn pad4(n: usize) -> usize {
    n.div_ceil(4) * 4
}

// --- Writer ----------------------------------------------------------------

struct Writer {
    out: Vec<u8>,
    version: u8,
}

impl Writer {
    fn u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    // Size or count: 32-bit in v1/v2, 64-bit in v5.
    fn non_neg(&mut self, v: i64) {
        if self.version == 5 {
            self.i64(v);
        } else {
            self.u32(v as u32);
        }
    }

    // File offset: 32-bit in v1 only.
    fn offset(&mut self, v: i64) {
        if self.version == 1 {
            self.u32(v as u32);
        } else {
            self.i64(v);
        }
    }

    fn name(&mut self, s: &str) {
        self.non_neg(s.len() as i64);
        self.out.extend_from_slice(s.as_bytes());
        for _ in s.len()..pad4(s.len()) {
            self.out.push(0);
        }
    }

    fn padded(&mut self, data: &[u8]) {
        self.out.extend_from_slice(data);
        for _ in data.len()..pad4(data.len()) {
            self.out.push(0);
        }
    }

    fn att_list(&mut self, atts: &[Att]) {
        if atts.is_empty() {
            self.u32(0);
            self.non_neg(0);
            return;
        }
        self.u32(TAG_ATTRIBUTE);
        self.non_neg(atts.len() as i64);
        for a in atts {
            self.name(&a.name);
            self.u32(a.xtype as i32 as u32);
            let esize = a.xtype.disk_size().unwrap();
            self.non_neg((a.data.len() / esize) as i64);
            let be = swap_elements(&a.data, a.xtype);
            self.padded(&be);
        }
    }
}

// Bytes of one variable's fixed body (or one record), padded.
fn vsize(model: &Model, var: &Var) -> i64 {
    let esize = var.xtype.disk_size().unwrap() as i64;
    pad4((model.rec_elems(var) * esize) as usize) as i64
}

/// Serialize the model to classic container bytes.
pub fn encode(model: &Model) -> Result<Vec<u8>> {
    for v in model.vars.iter() {
        // v1 cannot express the extended type set.
        if model.version != 5 && (v.xtype as i32) > PioType::Double as i32 {
            return Err(PioError::BadType);
        }
    }

    let rec_vars: Vec<usize> = (0..model.vars.len())
        .filter(|&v| model.is_rec_var(&model.vars[v]))
        .collect();

    // Header length is independent of the begin offsets (their field
    // width is fixed per flavour), so render once with zeros and once
    // with the real values.
    let mut begins = vec![0i64; model.vars.len()];
    let render = |begins: &[i64]| -> Vec<u8> {
        let mut w = Writer {
            out: Vec::new(),
            version: model.version,
        };
        w.out.extend_from_slice(b"CDF");
        w.out.push(model.version);
        w.non_neg(model.numrecs);

        if model.dims.is_empty() {
            w.u32(0);
            w.non_neg(0);
        } else {
            w.u32(TAG_DIMENSION);
            w.non_neg(model.dims.len() as i64);
            for d in &model.dims {
                w.name(&d.name);
                w.non_neg(d.len);
            }
        }

        w.att_list(&model.gatts);

        if model.vars.is_empty() {
            w.u32(0);
            w.non_neg(0);
        } else {
            w.u32(TAG_VARIABLE);
            w.non_neg(model.vars.len() as i64);
            for (i, v) in model.vars.iter().enumerate() {
                w.name(&v.name);
                w.non_neg(v.dimids.len() as i64);
                for &d in &v.dimids {
                    w.u32(d as u32);
                }
                w.att_list(&v.atts);
                w.u32(v.xtype as i32 as u32);
                w.non_neg(vsize(model, v));
                w.offset(begins[i]);
            }
        }
        w.out
    };

    let header_len = render(&begins).len() as i64;

    // Fixed variables first, then the interleaved record section.
    let mut pos = header_len;
    for (i, v) in model.vars.iter().enumerate() {
        if !model.is_rec_var(v) {
            begins[i] = pos;
            pos += vsize(model, v);
        }
    }
    for &i in &rec_vars {
        begins[i] = pos;
        pos += vsize(model, &model.vars[i]);
    }

    let mut out = render(&begins);
    debug_assert_eq!(out.len() as i64, header_len);

    for v in model.vars.iter() {
        if model.is_rec_var(v) {
            continue;
        }
        let be = swap_elements(&v.data, v.xtype);
        out.extend_from_slice(&be);
        for _ in be.len()..pad4(be.len()) {
            out.push(0);
        }
    }

    // Record section: records interleave across record variables. When a
    // single record variable exists its records are packed without
    // padding.
    let single_rec = rec_vars.len() == 1;
    for rec in 0..model.numrecs {
        for &i in &rec_vars {
            let v = &model.vars[i];
            let esize = v.xtype.disk_size()? as i64;
            let rec_bytes = (model.rec_elems(v) * esize) as usize;
            let off = rec as usize * rec_bytes;
            let slab = &v.data[off..off + rec_bytes];
            let be = swap_elements(slab, v.xtype);
            if single_rec {
                out.extend_from_slice(&be);
            } else {
                out.extend_from_slice(&be);
                for _ in rec_bytes..pad4(rec_bytes) {
                    out.push(0);
                }
            }
        }
    }

    Ok(out)
}

// --- Reader ----------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    off: usize,
    version: u8,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let s = self.buf.get(self.off..self.off + n).ok_or(PioError::NotNc)?;
        self.off += n;
        Ok(s)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn non_neg(&mut self) -> Result<i64> {
        if self.version == 5 {
            self.i64()
        } else {
            Ok(self.u32()? as i64)
        }
    }

    fn offset(&mut self) -> Result<i64> {
        if self.version == 1 {
            Ok(self.u32()? as i64)
        } else {
            self.i64()
        }
    }

    fn name(&mut self) -> Result<String> {
        let n = self.non_neg()? as usize;
        let s = String::from_utf8_lossy(self.take(n)?).to_string();
        self.take(pad4(n) - n)?;
        Ok(s)
    }

    fn att_list(&mut self) -> Result<Vec<Att>> {
        let tag = self.u32()?;
        let n = self.non_neg()? as usize;
        if tag != TAG_ATTRIBUTE && (tag != 0 || n != 0) {
            return Err(PioError::NotNc);
        }
        let mut atts = Vec::with_capacity(n);
        for _ in 0..n {
            let name = self.name()?;
            let xtype = PioType::from_i32(self.u32()? as i32)?;
            let nelems = self.non_neg()? as usize;
            let esize = xtype.disk_size()?;
            let raw = self.take(nelems * esize)?;
            let data = swap_elements(raw, xtype);
            self.take(pad4(nelems * esize) - nelems * esize)?;
            atts.push(Att { name, xtype, data });
        }
        Ok(atts)
    }
}

/// Parse classic container bytes back into a model.
pub fn decode(buf: &[u8]) -> Result<Model> {
    if buf.len() < 4 || &buf[..3] != b"CDF" {
        return Err(PioError::NotNc);
    }
    let version = buf[3];
    if !matches!(version, 1 | 2 | 5) {
        return Err(PioError::NotNc);
    }
    let mut r = Reader {
        buf,
        off: 4,
        version,
    };
    let numrecs = r.non_neg()?;

    let tag = r.u32()?;
    let ndims = r.non_neg()? as usize;
    if tag != TAG_DIMENSION && (tag != 0 || ndims != 0) {
        return Err(PioError::NotNc);
    }
    let mut dims = Vec::with_capacity(ndims);
    for _ in 0..ndims {
        let name = r.name()?;
        let len = r.non_neg()?;
        dims.push(Dim { name, len });
    }

    let gatts = r.att_list()?;

    let tag = r.u32()?;
    let nvars = r.non_neg()? as usize;
    if tag != TAG_VARIABLE && (tag != 0 || nvars != 0) {
        return Err(PioError::NotNc);
    }
    let mut vars = Vec::with_capacity(nvars);
    let mut begins = Vec::with_capacity(nvars);
    for _ in 0..nvars {
        let name = r.name()?;
        let nd = r.non_neg()? as usize;
        let mut dimids = Vec::with_capacity(nd);
        for _ in 0..nd {
            dimids.push(r.u32()? as i32);
        }
        let atts = r.att_list()?;
        let xtype = PioType::from_i32(r.u32()? as i32)?;
        let _vsize = r.non_neg()?;
        begins.push(r.offset()?);
        // The conventional fill attribute restores explicit fills.
        let fill = atts
            .iter()
            .find(|a| a.name == "_FillValue")
            .map(|a| a.data.clone());
        vars.push(Var {
            name,
            xtype,
            dimids,
            atts,
            fill,
            no_fill: false,
            data: Vec::new(),
        });
    }

    let mut model = Model {
        version,
        dims,
        gatts,
        vars,
        numrecs,
    };

    // Data sections.
    let rec_vars: Vec<usize> = (0..model.vars.len())
        .filter(|&v| model.is_rec_var(&model.vars[v]))
        .collect();
    let single_rec = rec_vars.len() == 1;

    for i in 0..model.vars.len() {
        if model.is_rec_var(&model.vars[i]) {
            continue;
        }
        let esize = model.vars[i].xtype.disk_size()?;
        let total = model.rec_elems(&model.vars[i]) as usize * esize;
        let start = begins[i] as usize;
        let raw = buf.get(start..start + total).ok_or(PioError::NotNc)?;
        model.vars[i].data = swap_elements(raw, model.vars[i].xtype);
    }

    for &i in rec_vars.iter() {
        let esize = model.vars[i].xtype.disk_size()?;
        let rec_bytes = model.rec_elems(&model.vars[i]) as usize * esize;
        let stride: usize = if single_rec {
            rec_bytes
        } else {
            rec_vars
                .iter()
                .map(|&j| vsize(&model, &model.vars[j]) as usize)
                .sum()
        };
        let mut data = Vec::with_capacity(rec_bytes * numrecs as usize);
        for rec in 0..numrecs {
            let start = begins[i] as usize + rec as usize * stride;
            let raw = buf.get(start..start + rec_bytes).ok_or(PioError::NotNc)?;
            data.extend_from_slice(raw);
        }
        model.vars[i].data = swap_elements(&data, model.vars[i].xtype);
    }

    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_bytes(vals: &[i32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    fn sample_model() -> Model {
        let mut m = Model::new(1);
        m.dims.push(Dim {
            name: "x".into(),
            len: 4,
        });
        m.gatts.push(Att {
            name: "tag".into(),
            xtype: PioType::Int,
            data: int_bytes(&[42]),
        });
        m.vars.push(Var {
            name: "v".into(),
            xtype: PioType::Int,
            dimids: vec![0],
            atts: Vec::new(),
            fill: None,
            no_fill: false,
            data: int_bytes(&[10, 20, 30, 40]),
        });
        m
    }

    #[test]
    fn test_magic_and_version() {
        let bytes = encode(&sample_model()).unwrap();
        assert_eq!(&bytes[..4], b"CDF\x01");
        let mut m2 = sample_model();
        m2.version = 2;
        assert_eq!(&encode(&m2).unwrap()[..4], b"CDF\x02");
        m2.version = 5;
        assert_eq!(&encode(&m2).unwrap()[..4], b"CDF\x05");
    }

    #[test]
    fn test_roundtrip_fixed_var() {
        let m = sample_model();
        let decoded = decode(&encode(&m).unwrap()).unwrap();
        assert_eq!(decoded.dims, m.dims);
        assert_eq!(decoded.gatts, m.gatts);
        assert_eq!(decoded.vars[0].data, m.vars[0].data);
    }

    #[test]
    fn test_roundtrip_record_vars() {
        let mut m = Model::new(2);
        m.dims.push(Dim {
            name: "t".into(),
            len: 0,
        });
        m.dims.push(Dim {
            name: "x".into(),
            len: 3,
        });
        m.vars.push(Var {
            name: "a".into(),
            xtype: PioType::Double,
            dimids: vec![0, 1],
            atts: Vec::new(),
            fill: None,
            no_fill: false,
            data: [1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0]
                .iter()
                .flat_map(|v| v.to_ne_bytes())
                .collect(),
        });
        m.vars.push(Var {
            name: "b".into(),
            xtype: PioType::Short,
            dimids: vec![0],
            atts: Vec::new(),
            fill: None,
            no_fill: false,
            data: [7i16, 8].iter().flat_map(|v| v.to_ne_bytes()).collect(),
        });
        m.numrecs = 2;
        let decoded = decode(&encode(&m).unwrap()).unwrap();
        assert_eq!(decoded.numrecs, 2);
        assert_eq!(decoded.vars[0].data, m.vars[0].data);
        assert_eq!(decoded.vars[1].data, m.vars[1].data);
    }

    #[test]
    fn test_v5_extended_types() {
        let mut m = Model::new(5);
        m.dims.push(Dim {
            name: "n".into(),
            len: 2,
        });
        m.vars.push(Var {
            name: "u".into(),
            xtype: PioType::UInt64,
            dimids: vec![0],
            atts: Vec::new(),
            fill: None,
            no_fill: false,
            data: [u64::MAX, 7].iter().flat_map(|v| v.to_ne_bytes()).collect(),
        });
        let decoded = decode(&encode(&m).unwrap()).unwrap();
        assert_eq!(decoded.vars[0].xtype, PioType::UInt64);
        assert_eq!(decoded.vars[0].data, m.vars[0].data);
    }

    #[test]
    fn test_v1_rejects_extended_types() {
        let mut m = Model::new(1);
        m.dims.push(Dim {
            name: "n".into(),
            len: 1,
        });
        m.vars.push(Var {
            name: "u".into(),
            xtype: PioType::UInt64,
            dimids: vec![0],
            atts: Vec::new(),
            fill: None,
            no_fill: false,
            data: vec![0u8; 8],
        });
        assert!(matches!(encode(&m), Err(PioError::BadType)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(b"HDF\x01xxxx"), Err(PioError::NotNc)));
        assert!(matches!(decode(b"CDF\x07xxxx"), Err(PioError::NotNc)));
        assert!(matches!(decode(b"CD"), Err(PioError::NotNc)));
    }

    #[test]
    fn test_odd_name_padding() {
        let mut m = sample_model();
        m.dims[0].name = "lon".into();
        m.vars[0].name = "humidity!".into();
        let decoded = decode(&encode(&m).unwrap()).unwrap();
        assert_eq!(decoded.dims[0].name, "lon");
        assert_eq!(decoded.vars[0].name, "humidity!");
    }

    #[test]
    fn test_grow_records_fills() {
        let mut m = Model::new(1);
        m.dims.push(Dim {
            name: "t".into(),
            len: 0,
        });
        m.vars.push(Var {
            name: "r".into(),
            xtype: PioType::Int,
            dimids: vec![0],
            atts: Vec::new(),
            fill: Some(int_bytes(&[-1])),
            no_fill: false,
            data: Vec::new(),
        });
        m.grow_records(3);
        assert_eq!(m.vars[0].data, int_bytes(&[-1, -1, -1]));
    }
}
