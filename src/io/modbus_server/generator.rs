// src/io/modbus_server/generator.rs
//
// Value generator: a per-address background task that writes a synthetic
// value into a server's register array on a fixed-period timer.

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::data::{store_words, Notifier, ServerData};
use crate::io::codec::{self, check_address_range, encode_string, round_decimals, DataType, RegisterValue};
use crate::io::{now_ms, ModbusError, RegisterType};

/// Where generated values come from.
#[derive(Clone, Debug, PartialEq)]
pub enum GeneratorSource {
    /// Uniform random value in `[min, max]`
    Random { min: f64, max: f64 },
    /// Fixed UTF-8 string packed into `length` registers
    Text { text: String, length: u16 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct GeneratorSpec {
    pub unit_id: u8,
    pub register_type: RegisterType,
    pub address: u16,
    pub data_type: DataType,
    pub little_endian: bool,
    pub source: GeneratorSource,
    /// Zero writes the initial value only
    pub interval: Duration,
}

impl GeneratorSpec {
    /// Number of registers this generator owns.
    pub fn word_count(&self) -> u16 {
        match (&self.source, self.data_type) {
            (GeneratorSource::Text { length, .. }, _) => (*length).max(1),
            (_, data_type) => codec::words_for(data_type),
        }
    }

    /// Compute the next value as registers.
    pub fn next_words(&self) -> Result<Vec<u16>, ModbusError> {
        let words = match (&self.source, self.data_type) {
            (_, DataType::Unix) => codec::encode(
                DataType::Unix,
                &RegisterValue::UInt(now_ms() / 1000),
                self.little_endian,
            )?,
            (_, DataType::DateTime) => codec::encode(
                DataType::DateTime,
                &RegisterValue::UInt(now_ms()),
                self.little_endian,
            )?,
            (GeneratorSource::Text { text, length }, _) => encode_string(text, (*length).max(1)),
            (GeneratorSource::Random { min, max }, data_type) => {
                let value = random_value(*min, *max, data_type.generator_decimals());
                codec::encode(data_type, &RegisterValue::Float(value), self.little_endian)?
            }
        };
        Ok(words)
    }
}

/// `round(random() * (max - min) + min, decimals)`; `min == max` pins the value.
pub fn random_value(min: f64, max: f64, decimals: i32) -> f64 {
    let r: f64 = rand::thread_rng().gen();
    round_decimals(r * (max - min) + min, decimals)
}

/// A running generator. Dispose it to stop the timer and clear its registers.
pub struct ValueGenerator {
    spec: GeneratorSpec,
    data: ServerData,
    notifier: Notifier,
    stopped: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl ValueGenerator {
    /// Write the initial value now, then start the periodic timer.
    pub fn start(spec: GeneratorSpec, data: ServerData, notifier: Notifier) -> Result<Self, ModbusError> {
        if spec.register_type.is_bit() {
            return Err(ModbusError::InvalidArgument(format!(
                "generators need a register class, not {}",
                spec.register_type
            )));
        }
        check_address_range(spec.address, spec.word_count())?;

        let stopped = Arc::new(AtomicBool::new(false));
        tick(&spec, &data, &notifier, &stopped)?;

        let task = if spec.interval.is_zero() {
            None
        } else {
            let (spec, data, notifier, stopped) =
                (spec.clone(), data.clone(), notifier.clone(), stopped.clone());
            Some(tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + spec.interval, spec.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Err(e) = tick(&spec, &data, &notifier, &stopped) {
                        tlog!(
                            "[ValueGenerator] unit {} {} @{}: {}",
                            spec.unit_id,
                            spec.register_type,
                            spec.address,
                            e
                        );
                    }
                }
            }))
        };

        Ok(Self {
            spec,
            data,
            notifier,
            stopped,
            task,
        })
    }

    pub fn spec(&self) -> &GeneratorSpec {
        &self.spec
    }

    /// Stop the timer and zero-fill exactly the registers this generator owns.
    pub fn dispose(mut self) {
        let spec = &self.spec;
        let zeros = vec![0u16; spec.word_count() as usize];
        // Stop and clear under the data lock so no tick can land after the zero-fill
        self.data.with_unit(spec.unit_id, |unit| {
            self.stopped.store(true, Ordering::SeqCst);
            store_words(
                unit,
                &self.notifier,
                spec.unit_id,
                spec.register_type,
                spec.address,
                &zeros,
            );
        });
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ValueGenerator {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Compute and store one value unless the generator has been stopped.
fn tick(
    spec: &GeneratorSpec,
    data: &ServerData,
    notifier: &Notifier,
    stopped: &AtomicBool,
) -> Result<(), ModbusError> {
    let words = spec.next_words()?;
    data.with_unit(spec.unit_id, |unit| {
        if stopped.load(Ordering::SeqCst) {
            return;
        }
        store_words(
            unit,
            notifier,
            spec.unit_id,
            spec.register_type,
            spec.address,
            &words,
        );
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BackendEvent, ChannelEmitter, EventEmitter};

    fn spec(data_type: DataType, min: f64, max: f64) -> GeneratorSpec {
        GeneratorSpec {
            unit_id: 1,
            register_type: RegisterType::HoldingRegisters,
            address: 100,
            data_type,
            little_endian: false,
            source: GeneratorSource::Random { min, max },
            interval: Duration::from_millis(1000),
        }
    }

    fn holding(data: &ServerData, address: usize, len: usize) -> Vec<u16> {
        data.with_unit(1, |u| {
            u.words(RegisterType::HoldingRegisters).unwrap()[address..address + len].to_vec()
        })
    }

    #[test]
    fn test_random_value_bounds() {
        for _ in 0..100 {
            let v = random_value(-5.0, 5.0, 2);
            assert!((-5.0..=5.0).contains(&v));
            assert_eq!(round_decimals(v, 2), v);
        }
        assert_eq!(random_value(42.0, 42.0, 0), 42.0);
    }

    #[test]
    fn test_word_count() {
        assert_eq!(spec(DataType::Double, 0.0, 1.0).word_count(), 4);
        let text = GeneratorSpec {
            source: GeneratorSource::Text {
                text: "abc".into(),
                length: 5,
            },
            ..spec(DataType::Utf8, 0.0, 0.0)
        };
        assert_eq!(text.word_count(), 5);
        assert_eq!(text.next_words().unwrap(), vec![0x6162, 0x6300, 0, 0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pinned_value_every_tick() {
        let data = ServerData::default();
        let (emitter, mut rx) = ChannelEmitter::new();
        let notifier = Notifier::new("srv", emitter as Arc<dyn EventEmitter>);
        let generator =
            ValueGenerator::start(spec(DataType::Int32, 70000.0, 70000.0), data.clone(), notifier)
                .unwrap();

        // Initial value is written synchronously
        assert_eq!(holding(&data, 100, 2), vec![1, 4464]);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let mut raws = Vec::new();
        while let Ok(BackendEvent::RegisterValue(p)) = rx.try_recv() {
            raws.push((p.address, p.raw));
        }
        // Initial write plus three ticks, two words each
        assert_eq!(raws.len(), 8);
        assert!(raws.chunks(2).all(|c| c == [(100, 1), (101, 4464)]));
        generator.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_zero_fills_only_owned_words() {
        let data = ServerData::default();
        let notifier = Notifier::new("srv", Arc::new(crate::events::NullEmitter));
        data.with_unit(1, |u| {
            let words = u.words_mut(RegisterType::HoldingRegisters).unwrap();
            words[99] = 7;
            words[104] = 8;
        });

        let generator =
            ValueGenerator::start(spec(DataType::Double, 1.5, 1.5), data.clone(), notifier).unwrap();
        assert_ne!(holding(&data, 100, 4), vec![0, 0, 0, 0]);

        generator.dispose();
        assert_eq!(holding(&data, 99, 6), vec![7, 0, 0, 0, 0, 8]);

        // No tick resurrects the value
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(holding(&data, 100, 4), vec![0, 0, 0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unix_ignores_range() {
        let data = ServerData::default();
        let notifier = Notifier::new("srv", Arc::new(crate::events::NullEmitter));
        let generator =
            ValueGenerator::start(spec(DataType::Unix, 0.0, 0.0), data.clone(), notifier).unwrap();
        let words = holding(&data, 100, 2);
        let seconds = ((words[0] as u64) << 16) | words[1] as u64;
        assert!(seconds > 1_600_000_000);
        generator.dispose();
    }

    #[test]
    fn test_rejects_out_of_space() {
        let mut s = spec(DataType::Int64, 0.0, 0.0);
        s.address = 65534;
        let result = ValueGenerator::start(
            s,
            ServerData::default(),
            Notifier::new("srv", Arc::new(crate::events::NullEmitter)),
        );
        assert!(result.is_err());
    }
}
