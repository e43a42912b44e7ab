//! Wire-Format fuer TCP-Verbindungen
//!
//! Frame-basiertes Protokoll: Length(u32 big-endian) + JSON-Payload.
//!
//! ## Frame-Format
//!
//! ```text
//! +--------+--------+--------+--------+----...----+
//! | Laenge (u32 BE) | 4 Bytes        | Payload    |
//! +--------+--------+--------+--------+----...----+
//! ```
//!
//! Die Laenge gibt die Anzahl der Payload-Bytes an (ohne die 4 Laengen-Bytes).
//! Maximale Frame-Groesse ist konfigurierbar (Standard: 1 MB).

use bytes::{Buf, BufMut, BytesMut};
use framelink_core::Message;
use serde::Serialize;
use std::io;
use std::marker::PhantomData;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

// ---------------------------------------------------------------------------
// Konstanten
// ---------------------------------------------------------------------------

/// Standard-maximale Frame-Groesse (1 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Groesse des Laengen-Felds in Bytes
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Groesste Payload, die das u32-Laengen-Feld darstellen kann
pub const MAX_DARSTELLBARE_GROESSE: usize = u32::MAX as usize;

// ---------------------------------------------------------------------------
// FrameCodec
// ---------------------------------------------------------------------------

/// tokio-util Codec fuer frame-basierte TCP-Verbindungen
///
/// Dekodiert Frames zu `M` und kodiert `&M` zu Frames. Kodiert wird per
/// Referenz, damit der Sender die Nachricht nach dem Schreiben noch an die
/// Gesendet-/Sendefehler-Handler weiterreichen kann.
///
/// # Beispiel
///
/// ```rust,no_run
/// use tokio_util::codec::FramedRead;
/// use framelink_protocol::FrameCodec;
///
/// // let stream = TcpStream::connect(...).await?;
/// // let frames = FramedRead::new(stream, FrameCodec::<serde_json::Value>::new());
/// ```
pub struct FrameCodec<M> {
    /// Maximale erlaubte Frame-Groesse in Bytes
    max_frame_size: usize,
    _nachricht: PhantomData<fn() -> M>,
}

impl<M> FrameCodec<M> {
    /// Erstellt einen neuen `FrameCodec` mit Standard-Limits
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Erstellt einen `FrameCodec` mit benutzerdefinierter maximaler Frame-Groesse
    ///
    /// Werte ueber `MAX_DARSTELLBARE_GROESSE` werden darauf begrenzt.
    pub fn with_max_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: begrenzen(max_frame_size),
            _nachricht: PhantomData,
        }
    }

    /// Gibt die konfigurierte maximale Frame-Groesse zurueck
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl<M> Default for FrameCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Clone for FrameCodec<M> {
    fn clone(&self) -> Self {
        Self::with_max_size(self.max_frame_size)
    }
}

impl<M> std::fmt::Debug for FrameCodec<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

fn begrenzen(max_frame_size: usize) -> usize {
    max_frame_size.min(MAX_DARSTELLBARE_GROESSE)
}

fn zu_gross(was: &str, laenge: usize, maximum: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{was} zu gross: {laenge} Bytes (Maximum: {maximum} Bytes)"),
    )
}

fn serialisieren<M: Serialize>(item: &M, max_frame_size: usize) -> io::Result<Vec<u8>> {
    let json = serde_json::to_vec(item).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("JSON-Serialisierung fehlgeschlagen: {}", e),
        )
    })?;

    if json.len() > max_frame_size {
        return Err(zu_gross("Nachricht", json.len(), max_frame_size));
    }
    Ok(json)
}

fn deserialisieren<M: Message>(payload: &[u8]) -> io::Result<M> {
    serde_json::from_slice(payload).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("JSON-Deserialisierung fehlgeschlagen: {}", e),
        )
    })
}

// ---------------------------------------------------------------------------
// Decoder-Implementierung
// ---------------------------------------------------------------------------

impl<M: Message> Decoder for FrameCodec<M> {
    type Item = M;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Warte auf mindestens 4 Bytes fuer das Laengen-Feld
        if src.len() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }

        // Laenge lesen (big-endian u32) ohne den Buffer zu veraendern
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > self.max_frame_size {
            return Err(zu_gross("Frame", length, self.max_frame_size));
        }

        // Pruefen ob der vollstaendige Frame bereits im Buffer ist
        let total_size = LENGTH_FIELD_SIZE + length;
        if src.len() < total_size {
            // Speicher vorbelegen um Reallocations zu vermeiden
            src.reserve(total_size - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_SIZE);
        let payload = src.split_to(length);

        deserialisieren(&payload).map(Some)
    }
}

// ---------------------------------------------------------------------------
// Encoder-Implementierung
// ---------------------------------------------------------------------------

impl<'a, M: Serialize> Encoder<&'a M> for FrameCodec<M> {
    type Error = io::Error;

    fn encode(&mut self, item: &'a M, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serialisieren(item, self.max_frame_size)?;

        // Laengen-Feld + Payload schreiben
        dst.reserve(LENGTH_FIELD_SIZE + json.len());
        dst.put_u32(json.len() as u32);
        dst.put_slice(&json);

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Hilfsfunktionen fuer direktes async Lesen/Schreiben
// ---------------------------------------------------------------------------

/// Liest einen einzelnen Frame aus einem `AsyncRead`
///
/// # Fehler
/// - `UnexpectedEof` wenn die Verbindung vor Abschluss des Frames getrennt wird
/// - `InvalidData` bei ungueltigem JSON oder zu grossem Frame
pub async fn read_frame<M, R>(reader: &mut R, max_frame_size: usize) -> io::Result<M>
where
    M: Message,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_FIELD_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let length = u32::from_be_bytes(len_buf) as usize;

    if length > max_frame_size {
        return Err(zu_gross("Frame", length, max_frame_size));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    deserialisieren(&payload)
}

/// Schreibt einen einzelnen Frame in einen `AsyncWrite`
///
/// # Fehler
/// - `InvalidData` wenn die Nachricht nicht serialisiert werden kann oder zu gross ist
/// - IO-Fehler beim Schreiben
pub async fn write_frame<M, W>(writer: &mut W, message: &M, max_frame_size: usize) -> io::Result<()>
where
    M: Serialize,
    W: AsyncWrite + Unpin,
{
    let json = serialisieren(message, begrenzen(max_frame_size))?;

    let len_bytes = (json.len() as u32).to_be_bytes();
    writer.write_all(&len_bytes).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Chat {
        seq: u32,
        text: String,
    }

    fn test_nachricht(seq: u32) -> Chat {
        Chat {
            seq,
            text: format!("hallo {seq}"),
        }
    }

    #[test]
    fn frame_codec_laengenfeld_entspricht_payload() {
        let mut codec = FrameCodec::<Chat>::new();
        let original = test_nachricht(42);

        let mut buf = BytesMut::new();
        codec.encode(&original, &mut buf).unwrap();

        let payload_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert!(payload_len > 0);
        assert_eq!(buf.len(), LENGTH_FIELD_SIZE + payload_len);

        let decoded = codec
            .decode(&mut buf)
            .unwrap()
            .expect("Muss eine Nachricht enthalten");
        assert_eq!(decoded, original);
    }

    #[test]
    fn frame_codec_unvollstaendiger_frame() {
        let mut codec = FrameCodec::<Chat>::new();

        let mut buf = BytesMut::new();
        codec.encode(&test_nachricht(1), &mut buf).unwrap();

        // Nur die Haelfte der Bytes behalten
        let half = buf.len() / 2;
        let mut partial = buf.split_to(half);

        // Sollte None zurueckgeben (wartet auf mehr Daten)
        let result = codec.decode(&mut partial).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn frame_codec_zu_wenig_bytes_fuer_laengenfeld() {
        let mut codec = FrameCodec::<Chat>::new();
        let mut buf = BytesMut::from(&[0x00, 0x00][..]);
        let result = codec.decode(&mut buf).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn frame_codec_ablehnung_zu_grosser_frame() {
        let mut codec = FrameCodec::<Chat>::with_max_size(100);

        let mut buf = BytesMut::new();
        buf.put_u32(200);
        buf.put_slice(&[b'x'; 200]);

        let result = codec.decode(&mut buf);
        assert!(result.is_err());
    }

    #[test]
    fn frame_codec_ablehnung_beim_encode_zu_grosse_nachricht() {
        let mut codec = FrameCodec::<Chat>::with_max_size(10);

        let mut buf = BytesMut::new();
        let result = codec.encode(&test_nachricht(1), &mut buf);
        assert!(result.is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_codec_ungueltiges_json() {
        let mut codec = FrameCodec::<Chat>::new();

        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_slice(b"{kaput");

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn frame_codec_mehrere_nachrichten_im_buffer() {
        let mut codec = FrameCodec::<Chat>::new();
        let mut buf = BytesMut::new();

        for i in 0..3u32 {
            codec.encode(&test_nachricht(i), &mut buf).unwrap();
        }

        for i in 0..3u32 {
            let msg = codec.decode(&mut buf).unwrap().expect("Nachricht erwartet");
            assert_eq!(msg.seq, i);
        }

        assert!(buf.is_empty());
    }

    #[test]
    fn frame_codec_default_max_size() {
        let codec = FrameCodec::<Chat>::default();
        assert_eq!(codec.max_frame_size(), DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(codec.clone().max_frame_size(), DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn frame_codec_grenze_passt_ins_laengenfeld() {
        let codec = FrameCodec::<Chat>::with_max_size(usize::MAX);
        assert_eq!(codec.max_frame_size(), MAX_DARSTELLBARE_GROESSE);

        // Laengen-Feld bleibt exakt, auch bei riesiger Grenze
        let mut codec = codec;
        let mut buf = BytesMut::new();
        codec.encode(&test_nachricht(7), &mut buf).unwrap();
        let laenge = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(laenge, buf.len() - LENGTH_FIELD_SIZE);
    }

    #[tokio::test]
    async fn async_write_frame_ist_mit_codec_lesbar() {
        let original = test_nachricht(99);

        let mut buffer: Vec<u8> = Vec::new();
        write_frame(&mut buffer, &original, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();

        let mut bytes = BytesMut::from(&buffer[..]);
        let decoded = FrameCodec::<Chat>::new()
            .decode(&mut bytes)
            .unwrap()
            .expect("Nachricht erwartet");
        assert_eq!(decoded, original);

        let mut cursor = io::Cursor::new(buffer);
        let gelesen: Chat = read_frame(&mut cursor, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        assert_eq!(gelesen, original);
    }

    #[tokio::test]
    async fn async_read_frame_ablehnung_zu_grosser_frame() {
        let mut buffer: Vec<u8> = Vec::new();
        // Laengen-Feld: 2 MB
        buffer.extend_from_slice(&(2u32 * 1024 * 1024).to_be_bytes());

        let mut cursor = io::Cursor::new(buffer);
        let result: io::Result<Chat> = read_frame(&mut cursor, DEFAULT_MAX_FRAME_SIZE).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn async_read_frame_abgebrochene_verbindung() {
        let mut buffer: Vec<u8> = Vec::new();
        buffer.extend_from_slice(&10u32.to_be_bytes());
        buffer.extend_from_slice(b"{\"se");

        let mut cursor = io::Cursor::new(buffer);
        let err = read_frame::<Chat, _>(&mut cursor, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
