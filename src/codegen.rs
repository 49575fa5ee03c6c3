//! IR generation for the rac language
//!
//! Walks the AST of one translation unit exactly once, in top-level order,
//! and emits LLVM IR through inkwell. Type information travels as source
//! spellings (`"i32"`, `"u8*"`, `"P"`) because signedness and pointees are
//! erased by the backend's integer and opaque-pointer types; the spelling
//! attached to every binding and expression result decides signed vs
//! unsigned instructions, float promotion, and struct resolution.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use inkwell::builder::{Builder, BuilderError};
use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::types::{
    BasicMetadataTypeEnum, BasicType, BasicTypeEnum, FloatType, FunctionType, StructType,
};
use inkwell::values::{
    BasicMetadataValueEnum, BasicValueEnum, FloatValue, FunctionValue, IntValue, PointerValue,
};
use inkwell::{AddressSpace, FloatPredicate, IntPredicate};
use thiserror::Error;

use crate::ast::{BinaryOp, Expr, FunctionDecl, Stmt, StructDecl, UnaryOp};
use crate::metadata::{ExportedFunction, ExportedStruct, MetadataError, ModuleMetadata};

/// Errors that abort IR generation
#[derive(Error, Debug)]
pub enum CodegenError {
    #[error("undefined variable `{0}`")]
    UndefinedVariable(String),

    #[error("cannot assign to constant `{0}`")]
    ConstAssignment(String),

    #[error("invalid assignment target")]
    InvalidAssignmentTarget,

    #[error("cannot dereference non-pointer value of type `{0}`")]
    NonPointerDeref(String),

    #[error("unknown struct `{0}`")]
    UnknownStruct(String),

    #[error("struct `{strukt}` has no field `{field}`")]
    UnknownField { strukt: String, field: String },

    #[error("struct literal for `{strukt}` must initialize {expected} field(s), got {got}")]
    FieldCountMismatch {
        strukt: String,
        expected: usize,
        got: usize,
    },

    #[error("call to undefined function `{0}`")]
    UndefinedFunction(String),

    #[error("`{name}` expects {expected} argument(s)")]
    ArityMismatch { name: String, expected: usize },

    #[error("module `{0}` has not been imported")]
    UnknownModule(String),

    #[error("module `{module}` does not export `{name}`")]
    UnknownModuleSymbol { module: String, name: String },

    #[error("{0} is only allowed inside a function")]
    StatementOutsideFunction(&'static str),

    #[error("void value used where a value is required")]
    VoidValue,

    #[error("operator `{op}` cannot be applied to `{ty}`")]
    InvalidOperand { op: &'static str, ty: String },

    #[error("condition does not evaluate to a scalar value")]
    InvalidCondition,

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("IR builder error: {0}")]
    Builder(#[from] BuilderError),
}

pub type CodegenResult<T> = Result<T, CodegenError>;

/// One name binding in the scope stack
#[derive(Clone)]
struct Binding<'ctx> {
    /// Stack slot backing the binding; `None` marks a global, which is
    /// resolved through the module's global table instead
    storage: Option<PointerValue<'ctx>>,
    /// Lowered backend type
    ty: BasicTypeEnum<'ctx>,
    /// Source type spelling
    type_name: String,
    is_const: bool,
}

/// A registered struct: the backend aggregate plus the declared field order
#[derive(Clone)]
struct StructInfo<'ctx> {
    ty: StructType<'ctx>,
    /// Fields as (name, type spelling), in declaration order; the field
    /// index is the position in this list
    fields: Vec<(String, String)>,
}

impl<'ctx> StructInfo<'ctx> {
    fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(field, _)| field == name)
    }
}

/// Signature of a function declared in the current module
struct FnSig {
    /// Backend symbol name, mangled for exported functions
    symbol: String,
    return_type: String,
}

/// An evaluated expression: the backend value (absent for void calls) plus
/// the source spelling it carries
struct RValue<'ctx> {
    value: Option<BasicValueEnum<'ctx>>,
    type_name: String,
}

impl<'ctx> RValue<'ctx> {
    fn new(value: impl Into<BasicValueEnum<'ctx>>, type_name: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            type_name: type_name.into(),
        }
    }

    fn void() -> Self {
        Self {
            value: None,
            type_name: "void".to_string(),
        }
    }

    fn basic(&self) -> CodegenResult<BasicValueEnum<'ctx>> {
        self.value.ok_or(CodegenError::VoidValue)
    }
}

/// IR generator for one translation unit
pub struct Codegen<'ctx> {
    context: &'ctx Context,
    module: Module<'ctx>,
    builder: Builder<'ctx>,
    module_name: String,
    /// Directory import metadata is resolved against
    base_dir: PathBuf,
    /// Scope stack; frame 0 holds the globals
    scopes: Vec<HashMap<String, Binding<'ctx>>>,
    /// Structs visible to this unit (own and imported)
    structs: HashMap<String, StructInfo<'ctx>>,
    /// Functions declared in this unit, keyed by source name
    functions: HashMap<String, FnSig>,
    /// Loaded import metadata, at most one entry per module
    imports: HashMap<String, ModuleMetadata>,
    /// Exported surface, in declaration order
    exports: ModuleMetadata,
    current_fn: Option<FunctionValue<'ctx>>,
    string_counter: u32,
}

impl<'ctx> Codegen<'ctx> {
    pub fn new(context: &'ctx Context, module_name: &str, base_dir: &Path) -> Self {
        let module = context.create_module(module_name);
        let builder = context.create_builder();

        Self {
            context,
            module,
            builder,
            module_name: module_name.to_string(),
            base_dir: base_dir.to_path_buf(),
            scopes: vec![HashMap::new()],
            structs: HashMap::new(),
            functions: HashMap::new(),
            imports: HashMap::new(),
            exports: ModuleMetadata::new(module_name),
            current_fn: None,
            string_counter: 0,
        }
    }

    /// Lower a whole translation unit
    pub fn generate(&mut self, program: &[Stmt]) -> CodegenResult<()> {
        for stmt in program {
            self.gen_statement(stmt)?;
        }
        Ok(())
    }

    /// The produced backend module
    pub fn module(&self) -> &Module<'ctx> {
        &self.module
    }

    /// Exported functions and structs, in declaration order
    pub fn exports(&self) -> &ModuleMetadata {
        &self.exports
    }

    /// Verify the module
    pub fn verify(&self) -> Result<(), String> {
        self.module.verify().map_err(|e| e.to_string())
    }

    /// Get the IR as a string
    pub fn print_ir(&self) -> String {
        self.module.print_to_string().to_string()
    }

    /// Load the metadata of an imported module and materialize its exported
    /// structs. Loading is idempotent; each module is read at most once.
    pub fn load_import(&mut self, module: &str) -> CodegenResult<()> {
        if self.imports.contains_key(module) {
            return Ok(());
        }

        let path = self
            .base_dir
            .join(format!("{}.{}", module, crate::METADATA_EXTENSION));
        // A module with no exports writes no sidecar; importing it is legal
        // but provides no symbols.
        let metadata = if path.exists() {
            ModuleMetadata::load(&path)?
        } else {
            ModuleMetadata::new(module)
        };

        for st in &metadata.structs {
            if self.structs.contains_key(&st.name) {
                continue;
            }
            self.register_struct(&st.name, &st.fields);
        }

        self.imports.insert(module.to_string(), metadata);
        Ok(())
    }

    // ============ Types and scopes ============

    /// Lower a source type spelling to a backend type.
    ///
    /// Signedness is not encoded in the backend type; the spelling stays in
    /// the binding record and decides which instructions are used. Unknown
    /// spellings fall back to i32, the language's weak default.
    fn lower_type(&self, spelling: &str) -> BasicTypeEnum<'ctx> {
        if spelling.ends_with('*') {
            return self.context.ptr_type(AddressSpace::default()).into();
        }

        match spelling {
            "i8" | "u8" | "bool" | "char" => self.context.i8_type().into(),
            "i16" | "u16" => self.context.i16_type().into(),
            "i32" | "u32" => self.context.i32_type().into(),
            // usize is pointer-sized; 64-bit targets are assumed.
            "i64" | "u64" | "usize" => self.context.i64_type().into(),
            "i128" | "u128" => self.context.i128_type().into(),
            "f32" => self.context.f32_type().into(),
            "f64" => self.context.f64_type().into(),
            other => match self.structs.get(other) {
                Some(info) => info.ty.into(),
                None => self.context.i32_type().into(),
            },
        }
    }

    fn function_type(&self, params: &[(String, String)], return_type: &str) -> FunctionType<'ctx> {
        let param_types: Vec<BasicMetadataTypeEnum<'ctx>> = params
            .iter()
            .map(|(_, ty)| self.lower_type(ty).into())
            .collect();

        if return_type == "void" {
            self.context.void_type().fn_type(&param_types, false)
        } else {
            self.lower_type(return_type).fn_type(&param_types, false)
        }
    }

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    /// Insert a binding into the innermost frame
    fn declare(&mut self, name: &str, binding: Binding<'ctx>) {
        self.scopes
            .last_mut()
            .expect("scope stack is never empty")
            .insert(name.to_string(), binding);
    }

    /// Resolve a name, walking the scope stack from innermost to outermost
    fn resolve(&self, name: &str) -> Option<&Binding<'ctx>> {
        self.scopes.iter().rev().find_map(|frame| frame.get(name))
    }

    fn require_function(&self, what: &'static str) -> CodegenResult<FunctionValue<'ctx>> {
        self.current_fn
            .ok_or(CodegenError::StatementOutsideFunction(what))
    }

    /// Allocate a stack slot in the function's entry block, regardless of
    /// where the builder currently sits, so storage is unconditional.
    fn create_entry_alloca(
        &self,
        name: &str,
        ty: BasicTypeEnum<'ctx>,
    ) -> CodegenResult<PointerValue<'ctx>> {
        let function = self.require_function("a variable declaration")?;
        let entry = function
            .get_first_basic_block()
            .expect("current function has an entry block");

        let tmp = self.context.create_builder();
        match entry.get_first_instruction() {
            Some(first) => tmp.position_before(&first),
            None => tmp.position_at_end(entry),
        }

        Ok(tmp.build_alloca(ty, name)?)
    }

    fn register_struct(&mut self, name: &str, fields: &[(String, String)]) {
        let struct_ty = self.context.opaque_struct_type(name);
        // Register before lowering the fields so pointer fields naming this
        // struct resolve.
        self.structs.insert(
            name.to_string(),
            StructInfo {
                ty: struct_ty,
                fields: fields.to_vec(),
            },
        );

        let field_types: Vec<BasicTypeEnum<'ctx>> = fields
            .iter()
            .map(|(_, ty)| self.lower_type(ty))
            .collect();
        struct_ty.set_body(&field_types, false);
    }

    // ============ Value helpers ============

    /// Collapse a condition value to the i1 selector branching needs
    fn truthify(&self, value: BasicValueEnum<'ctx>) -> CodegenResult<IntValue<'ctx>> {
        match value {
            BasicValueEnum::IntValue(int) => {
                if int.get_type().get_bit_width() == 1 {
                    return Ok(int);
                }
                let zero = int.get_type().const_zero();
                Ok(self
                    .builder
                    .build_int_compare(IntPredicate::NE, int, zero, "tobool")?)
            }
            BasicValueEnum::FloatValue(float) => {
                let zero = float.get_type().const_zero();
                Ok(self
                    .builder
                    .build_float_compare(FloatPredicate::ONE, float, zero, "tobool")?)
            }
            _ => Err(CodegenError::InvalidCondition),
        }
    }

    /// Booleans are stored as 8-bit integers; widen the backend's i1
    fn bool_to_i8(&self, flag: IntValue<'ctx>) -> CodegenResult<BasicValueEnum<'ctx>> {
        Ok(self
            .builder
            .build_int_z_extend(flag, self.context.i8_type(), "booltmp")?
            .into())
    }

    /// Match an integer value's width to the destination type; any other
    /// combination passes through untouched
    fn coerce(
        &self,
        value: BasicValueEnum<'ctx>,
        dest: BasicTypeEnum<'ctx>,
    ) -> CodegenResult<BasicValueEnum<'ctx>> {
        let (BasicTypeEnum::IntType(dest_ty), BasicValueEnum::IntValue(int)) = (dest, value)
        else {
            return Ok(value);
        };

        let have = int.get_type().get_bit_width();
        let want = dest_ty.get_bit_width();
        if have == want {
            Ok(value)
        } else if have < want {
            Ok(self.builder.build_int_s_extend(int, dest_ty, "sext")?.into())
        } else {
            Ok(self.builder.build_int_truncate(int, dest_ty, "trunc")?.into())
        }
    }

    fn int_to_float(
        &self,
        int: IntValue<'ctx>,
        dest: FloatType<'ctx>,
        spelling: &str,
    ) -> CodegenResult<FloatValue<'ctx>> {
        if spelling.starts_with('u') {
            Ok(self
                .builder
                .build_unsigned_int_to_float(int, dest, "uitofp")?)
        } else {
            Ok(self.builder.build_signed_int_to_float(int, dest, "sitofp")?)
        }
    }

    /// Apply the binary promotion rules: if either side is floating the
    /// integer side is converted; mixed float widths widen to f64; mixed
    /// integer widths sign-extend the narrower side. Returns the promoted
    /// operands and the result spelling.
    fn promote(
        &self,
        op: &'static str,
        lhs: &RValue<'ctx>,
        rhs: &RValue<'ctx>,
    ) -> CodegenResult<(BasicValueEnum<'ctx>, BasicValueEnum<'ctx>, String)> {
        let mut left = lhs.basic()?;
        let mut right = rhs.basic()?;

        if left.is_float_value() || right.is_float_value() {
            if left.is_int_value() {
                left = self
                    .int_to_float(
                        left.into_int_value(),
                        right.get_type().into_float_type(),
                        &lhs.type_name,
                    )?
                    .into();
            }
            if right.is_int_value() {
                right = self
                    .int_to_float(
                        right.into_int_value(),
                        left.get_type().into_float_type(),
                        &rhs.type_name,
                    )?
                    .into();
            }

            let mut lf = left.into_float_value();
            let mut rf = right.into_float_value();
            let spelling = if lf.get_type() == rf.get_type() {
                if lf.get_type() == self.context.f64_type() {
                    "f64"
                } else {
                    "f32"
                }
            } else {
                let f64_ty = self.context.f64_type();
                lf = self.builder.build_float_cast(lf, f64_ty, "fpext")?;
                rf = self.builder.build_float_cast(rf, f64_ty, "fpext")?;
                "f64"
            };
            return Ok((lf.into(), rf.into(), spelling.to_string()));
        }

        let (BasicValueEnum::IntValue(mut li), BasicValueEnum::IntValue(mut ri)) = (left, right)
        else {
            return Err(CodegenError::InvalidOperand {
                op,
                ty: lhs.type_name.clone(),
            });
        };

        let lw = li.get_type().get_bit_width();
        let rw = ri.get_type().get_bit_width();
        let spelling = if lw >= rw {
            lhs.type_name.clone()
        } else {
            rhs.type_name.clone()
        };
        if lw < rw {
            li = self.builder.build_int_s_extend(li, ri.get_type(), "sext")?;
        } else if rw < lw {
            ri = self.builder.build_int_s_extend(ri, li.get_type(), "sext")?;
        }

        Ok((li.into(), ri.into(), spelling))
    }

    // ============ Expressions ============

    fn gen_expr(&mut self, expr: &Expr) -> CodegenResult<RValue<'ctx>> {
        match expr {
            Expr::Int(value) => Ok(RValue::new(
                self.context.i32_type().const_int(*value as u64, true),
                "i32",
            )),
            Expr::Float(value) => Ok(RValue::new(
                self.context.f32_type().const_float(*value as f64),
                "f32",
            )),
            Expr::Bool(value) => Ok(RValue::new(
                self.context.i8_type().const_int(*value as u64, false),
                "bool",
            )),
            Expr::Char(value) => Ok(RValue::new(
                self.context.i8_type().const_int(*value as u64, false),
                "char",
            )),
            Expr::Str(value) => {
                let name = format!(".str.{}", self.string_counter);
                self.string_counter += 1;
                let global = self.builder.build_global_string_ptr(value, &name)?;
                Ok(RValue::new(global.as_pointer_value(), "char*"))
            }
            Expr::Variable(name) => {
                let binding = self
                    .resolve(name)
                    .ok_or_else(|| CodegenError::UndefinedVariable(name.clone()))?
                    .clone();
                let ptr = self.binding_storage(name, &binding)?;
                let value = self.builder.build_load(binding.ty, ptr, name)?;
                Ok(RValue::new(value, binding.type_name))
            }
            Expr::Unary { op, operand } => self.gen_unary(*op, operand),
            Expr::Binary { op, left, right } => self.gen_binary(*op, left, right),
            Expr::Call {
                module,
                name,
                type_arg,
                args,
            } => self.gen_call(module.as_deref(), name, type_arg.as_deref(), args),
            Expr::Member { .. } => {
                let (ptr, spelling) = self.gen_lvalue(expr)?;
                let value = self.builder.build_load(self.lower_type(&spelling), ptr, "fieldtmp")?;
                Ok(RValue::new(value, spelling))
            }
            Expr::StructLiteral { name, fields, .. } => self.gen_struct_literal(name, fields),
        }
    }

    fn gen_unary(&mut self, op: UnaryOp, operand: &Expr) -> CodegenResult<RValue<'ctx>> {
        match op {
            UnaryOp::Neg => {
                let value = self.gen_expr(operand)?;
                match value.basic()? {
                    BasicValueEnum::IntValue(int) => Ok(RValue::new(
                        self.builder.build_int_neg(int, "negtmp")?,
                        value.type_name,
                    )),
                    BasicValueEnum::FloatValue(float) => Ok(RValue::new(
                        self.builder.build_float_neg(float, "fnegtmp")?,
                        value.type_name,
                    )),
                    _ => Err(CodegenError::InvalidOperand {
                        op: "-",
                        ty: value.type_name.clone(),
                    }),
                }
            }
            UnaryOp::Not => {
                let value = self.gen_expr(operand)?;
                let flag = self.truthify(value.basic()?)?;
                let inverted = self.builder.build_not(flag, "nottmp")?;
                Ok(RValue {
                    value: Some(self.bool_to_i8(inverted)?),
                    type_name: "bool".to_string(),
                })
            }
            UnaryOp::AddrOf => {
                let (ptr, spelling) = self.gen_lvalue(operand)?;
                Ok(RValue::new(ptr, format!("{}*", spelling)))
            }
            UnaryOp::Deref => {
                let value = self.gen_expr(operand)?;
                let Some(pointee) = value.type_name.strip_suffix('*') else {
                    return Err(CodegenError::NonPointerDeref(value.type_name.clone()));
                };
                let pointee = pointee.to_string();
                let ptr = value.basic()?.into_pointer_value();
                let loaded = self.builder.build_load(self.lower_type(&pointee), ptr, "dereftmp")?;
                Ok(RValue::new(loaded, pointee))
            }
        }
    }

    fn gen_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> CodegenResult<RValue<'ctx>> {
        if op == BinaryOp::Assign {
            return self.gen_assignment(left, right);
        }

        let lhs = self.gen_expr(left)?;
        let rhs = self.gen_expr(right)?;

        match op {
            BinaryOp::And | BinaryOp::Or => {
                // Both operands are truthified and combined bitwise; no
                // short-circuiting.
                let lf = self.truthify(lhs.basic()?)?;
                let rf = self.truthify(rhs.basic()?)?;
                let combined = match op {
                    BinaryOp::And => self.builder.build_and(lf, rf, "andtmp")?,
                    _ => self.builder.build_or(lf, rf, "ortmp")?,
                };
                Ok(RValue {
                    value: Some(self.bool_to_i8(combined)?),
                    type_name: "bool".to_string(),
                })
            }
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
                self.gen_arithmetic(op, &lhs, &rhs)
            }
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => self.gen_comparison(op, &lhs, &rhs),
            BinaryOp::Assign => unreachable!("assignment handled above"),
        }
    }

    fn gen_arithmetic(
        &mut self,
        op: BinaryOp,
        lhs: &RValue<'ctx>,
        rhs: &RValue<'ctx>,
    ) -> CodegenResult<RValue<'ctx>> {
        // Division and remainder pick signed or unsigned instructions from
        // the left operand's spelling.
        let unsigned = lhs.type_name.starts_with('u');
        let (left, right, spelling) = self.promote("arithmetic", lhs, rhs)?;

        if left.is_float_value() {
            let lf = left.into_float_value();
            let rf = right.into_float_value();
            let result = match op {
                BinaryOp::Add => self.builder.build_float_add(lf, rf, "faddtmp")?,
                BinaryOp::Sub => self.builder.build_float_sub(lf, rf, "fsubtmp")?,
                BinaryOp::Mul => self.builder.build_float_mul(lf, rf, "fmultmp")?,
                BinaryOp::Div => self.builder.build_float_div(lf, rf, "fdivtmp")?,
                BinaryOp::Rem => self.builder.build_float_rem(lf, rf, "fremtmp")?,
                _ => unreachable!(),
            };
            return Ok(RValue::new(result, spelling));
        }

        let li = left.into_int_value();
        let ri = right.into_int_value();
        let result = match op {
            BinaryOp::Add => self.builder.build_int_add(li, ri, "addtmp")?,
            BinaryOp::Sub => self.builder.build_int_sub(li, ri, "subtmp")?,
            BinaryOp::Mul => self.builder.build_int_mul(li, ri, "multmp")?,
            BinaryOp::Div if unsigned => {
                self.builder.build_int_unsigned_div(li, ri, "udivtmp")?
            }
            BinaryOp::Div => self.builder.build_int_signed_div(li, ri, "sdivtmp")?,
            BinaryOp::Rem if unsigned => {
                self.builder.build_int_unsigned_rem(li, ri, "uremtmp")?
            }
            BinaryOp::Rem => self.builder.build_int_signed_rem(li, ri, "sremtmp")?,
            _ => unreachable!(),
        };
        Ok(RValue::new(result, spelling))
    }

    fn gen_comparison(
        &mut self,
        op: BinaryOp,
        lhs: &RValue<'ctx>,
        rhs: &RValue<'ctx>,
    ) -> CodegenResult<RValue<'ctx>> {
        let unsigned = lhs.type_name.starts_with('u');
        let (left, right, _) = self.promote("comparison", lhs, rhs)?;

        let flag = if left.is_float_value() {
            let pred = match op {
                BinaryOp::Eq => FloatPredicate::OEQ,
                BinaryOp::Ne => FloatPredicate::ONE,
                BinaryOp::Lt => FloatPredicate::OLT,
                BinaryOp::Le => FloatPredicate::OLE,
                BinaryOp::Gt => FloatPredicate::OGT,
                BinaryOp::Ge => FloatPredicate::OGE,
                _ => unreachable!(),
            };
            self.builder.build_float_compare(
                pred,
                left.into_float_value(),
                right.into_float_value(),
                "fcmptmp",
            )?
        } else {
            let pred = match (op, unsigned) {
                (BinaryOp::Eq, _) => IntPredicate::EQ,
                (BinaryOp::Ne, _) => IntPredicate::NE,
                (BinaryOp::Lt, false) => IntPredicate::SLT,
                (BinaryOp::Lt, true) => IntPredicate::ULT,
                (BinaryOp::Le, false) => IntPredicate::SLE,
                (BinaryOp::Le, true) => IntPredicate::ULE,
                (BinaryOp::Gt, false) => IntPredicate::SGT,
                (BinaryOp::Gt, true) => IntPredicate::UGT,
                (BinaryOp::Ge, false) => IntPredicate::SGE,
                (BinaryOp::Ge, true) => IntPredicate::UGE,
                _ => unreachable!(),
            };
            self.builder.build_int_compare(
                pred,
                left.into_int_value(),
                right.into_int_value(),
                "cmptmp",
            )?
        };

        Ok(RValue {
            value: Some(self.bool_to_i8(flag)?),
            type_name: "bool".to_string(),
        })
    }

    fn gen_assignment(&mut self, target: &Expr, value: &Expr) -> CodegenResult<RValue<'ctx>> {
        if let Expr::Variable(name) = target {
            let binding = self
                .resolve(name)
                .ok_or_else(|| CodegenError::UndefinedVariable(name.clone()))?;
            if binding.is_const {
                return Err(CodegenError::ConstAssignment(name.clone()));
            }
        }

        let rhs = self.gen_expr(value)?;
        let stored = rhs.basic()?;
        let (ptr, spelling) = self.gen_lvalue(target)?;
        let coerced = self.coerce(stored, self.lower_type(&spelling))?;
        self.builder.build_store(ptr, coerced)?;

        // The assignment's own value is the stored value.
        Ok(RValue::new(coerced, spelling))
    }

    /// Compute the storage an lvalue expression designates. Accepts
    /// variables, pointer dereferences, and struct member accesses.
    fn gen_lvalue(&mut self, expr: &Expr) -> CodegenResult<(PointerValue<'ctx>, String)> {
        match expr {
            Expr::Variable(name) => {
                let binding = self
                    .resolve(name)
                    .ok_or_else(|| CodegenError::UndefinedVariable(name.clone()))?
                    .clone();
                let ptr = self.binding_storage(name, &binding)?;
                Ok((ptr, binding.type_name))
            }
            Expr::Unary {
                op: UnaryOp::Deref,
                operand,
            } => {
                let value = self.gen_expr(operand)?;
                let Some(pointee) = value.type_name.strip_suffix('*') else {
                    return Err(CodegenError::NonPointerDeref(value.type_name.clone()));
                };
                Ok((value.basic()?.into_pointer_value(), pointee.to_string()))
            }
            Expr::Member { object, field } => {
                let (base, struct_name) = self.struct_base(object)?;
                let info = self
                    .structs
                    .get(&struct_name)
                    .cloned()
                    .ok_or_else(|| CodegenError::UnknownStruct(struct_name.clone()))?;
                let index = info.field_index(field).ok_or_else(|| {
                    CodegenError::UnknownField {
                        strukt: struct_name.clone(),
                        field: field.clone(),
                    }
                })?;
                let field_ptr =
                    self.builder
                        .build_struct_gep(info.ty, base, index as u32, field)?;
                Ok((field_ptr, info.fields[index].1.clone()))
            }
            _ => Err(CodegenError::InvalidAssignmentTarget),
        }
    }

    /// Resolve the address and struct name a member access goes through.
    /// Pointer-to-struct objects are loaded and addressed through.
    fn struct_base(&mut self, object: &Expr) -> CodegenResult<(PointerValue<'ctx>, String)> {
        let (ptr, spelling) = self.gen_lvalue(object)?;
        if let Some(pointee) = spelling.strip_suffix('*') {
            let loaded = self.builder.build_load(
                self.context.ptr_type(AddressSpace::default()),
                ptr,
                "structptr",
            )?;
            return Ok((loaded.into_pointer_value(), pointee.to_string()));
        }
        Ok((ptr, spelling))
    }

    /// Storage handle of a binding; globals go through the module table
    fn binding_storage(
        &self,
        name: &str,
        binding: &Binding<'ctx>,
    ) -> CodegenResult<PointerValue<'ctx>> {
        match binding.storage {
            Some(ptr) => Ok(ptr),
            None => self
                .module
                .get_global(name)
                .map(|global| global.as_pointer_value())
                .ok_or_else(|| CodegenError::UndefinedVariable(name.to_string())),
        }
    }

    fn gen_struct_literal(
        &mut self,
        name: &str,
        fields: &[(String, Expr)],
    ) -> CodegenResult<RValue<'ctx>> {
        let info = self
            .structs
            .get(name)
            .cloned()
            .ok_or_else(|| CodegenError::UnknownStruct(name.to_string()))?;

        if fields.len() != info.fields.len() {
            return Err(CodegenError::FieldCountMismatch {
                strukt: name.to_string(),
                expected: info.fields.len(),
                got: fields.len(),
            });
        }

        let slot = self.create_entry_alloca(&format!("{}.lit", name), info.ty.into())?;

        for (field_name, field_expr) in fields {
            let index = info.field_index(field_name).ok_or_else(|| {
                CodegenError::UnknownField {
                    strukt: name.to_string(),
                    field: field_name.clone(),
                }
            })?;
            let value = self.gen_expr(field_expr)?.basic()?;
            let coerced = self.coerce(value, self.lower_type(&info.fields[index].1))?;
            let field_ptr =
                self.builder
                    .build_struct_gep(info.ty, slot, index as u32, field_name)?;
            self.builder.build_store(field_ptr, coerced)?;
        }

        let aggregate = self.builder.build_load(info.ty, slot, "littmp")?;
        Ok(RValue::new(aggregate, name))
    }

    // ============ Calls ============

    fn gen_call(
        &mut self,
        module: Option<&str>,
        name: &str,
        type_arg: Option<&str>,
        args: &[Expr],
    ) -> CodegenResult<RValue<'ctx>> {
        // The allocation intrinsics expand regardless of any declaration.
        if module.is_none() {
            match name {
                "malloc" => return self.gen_malloc(type_arg, args),
                "free" => return self.gen_free(args),
                _ => {}
            }
        }

        let (function, return_type) = match module {
            Some(module_name) => {
                let metadata = self
                    .imports
                    .get(module_name)
                    .ok_or_else(|| CodegenError::UnknownModule(module_name.to_string()))?;
                let signature = metadata.find_function(name).ok_or_else(|| {
                    CodegenError::UnknownModuleSymbol {
                        module: module_name.to_string(),
                        name: name.to_string(),
                    }
                })?;
                let return_type = signature.return_type.clone();
                let params = signature.params.clone();

                // Cross-module symbols use the mangled name; declare on
                // first use from the metadata's signature.
                let symbol = format!("{}_{}", module_name, name);
                let function = match self.module.get_function(&symbol) {
                    Some(function) => function,
                    None => {
                        let fn_type = self.function_type(&params, &return_type);
                        self.module.add_function(&symbol, fn_type, None)
                    }
                };
                (function, return_type)
            }
            None => {
                let signature = self
                    .functions
                    .get(name)
                    .ok_or_else(|| CodegenError::UndefinedFunction(name.to_string()))?;
                let function = self
                    .module
                    .get_function(&signature.symbol)
                    .ok_or_else(|| CodegenError::UndefinedFunction(name.to_string()))?;
                (function, signature.return_type.clone())
            }
        };

        let param_types = function.get_type().get_param_types();
        let mut call_args: Vec<BasicMetadataValueEnum<'ctx>> = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            let mut value = self.gen_expr(arg)?.basic()?;
            if let Some(dest) = param_types.get(i) {
                value = self.coerce(value, BasicTypeEnum::try_from(*dest).unwrap())?;
            }
            call_args.push(value.into());
        }

        let site = self.builder.build_call(function, &call_args, "calltmp")?;
        match site.try_as_basic_value().left() {
            Some(value) => Ok(RValue::new(value, return_type)),
            None => Ok(RValue::void()),
        }
    }

    /// `malloc<T>(count)` — call the C runtime allocator with
    /// `count * sizeof(T)` bytes and hand the result back as a `T*`
    fn gen_malloc(&mut self, type_arg: Option<&str>, args: &[Expr]) -> CodegenResult<RValue<'ctx>> {
        if args.len() != 1 {
            return Err(CodegenError::ArityMismatch {
                name: "malloc".to_string(),
                expected: 1,
            });
        }

        let element = type_arg.unwrap_or("i32");
        let element_ty = self.lower_type(element);

        let i64_ty = self.context.i64_type();
        let malloc_fn = self.module.get_function("malloc").unwrap_or_else(|| {
            let ptr_ty = self.context.ptr_type(AddressSpace::default());
            let fn_type = ptr_ty.fn_type(&[i64_ty.into()], false);
            self.module.add_function("malloc", fn_type, None)
        });

        let count = self.gen_expr(&args[0])?.basic()?;
        let count = self.coerce(count, i64_ty.into())?.into_int_value();
        let size = element_ty
            .size_of()
            .expect("sized type from lower_type");
        let bytes = self.builder.build_int_mul(count, size, "mallocsize")?;

        let site = self
            .builder
            .build_call(malloc_fn, &[bytes.into()], "malloctmp")?;
        let raw = site
            .try_as_basic_value()
            .left()
            .ok_or(CodegenError::VoidValue)?;

        Ok(RValue::new(raw, format!("{}*", element)))
    }

    /// `free(ptr)` — call the C runtime deallocator on an opaque pointer
    fn gen_free(&mut self, args: &[Expr]) -> CodegenResult<RValue<'ctx>> {
        if args.len() != 1 {
            return Err(CodegenError::ArityMismatch {
                name: "free".to_string(),
                expected: 1,
            });
        }

        let ptr_ty = self.context.ptr_type(AddressSpace::default());
        let free_fn = self.module.get_function("free").unwrap_or_else(|| {
            let fn_type = self.context.void_type().fn_type(&[ptr_ty.into()], false);
            self.module.add_function("free", fn_type, None)
        });

        let operand = self.gen_expr(&args[0])?.basic()?;
        let pointer = match operand {
            BasicValueEnum::PointerValue(ptr) => ptr,
            BasicValueEnum::IntValue(int) => {
                self.builder.build_int_to_ptr(int, ptr_ty, "inttoptr")?
            }
            other => {
                return Err(CodegenError::InvalidOperand {
                    op: "free",
                    ty: format!("{:?}", other.get_type()),
                })
            }
        };

        self.builder.build_call(free_fn, &[pointer.into()], "")?;
        Ok(RValue::void())
    }

    // ============ Statements ============

    fn gen_statement(&mut self, stmt: &Stmt) -> CodegenResult<()> {
        match stmt {
            Stmt::Var {
                name,
                ty,
                init,
                is_const,
            } => self.gen_var_decl(name, ty, init.as_ref(), *is_const),
            Stmt::Function(decl) => self.gen_function(decl),
            Stmt::Struct(decl) => self.gen_struct_decl(decl),
            Stmt::Import { module } => self.load_import(module),
            Stmt::Expr(expr) => {
                self.require_function("an expression statement")?;
                self.gen_expr(expr)?;
                Ok(())
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
            } => self.gen_if(condition, then_branch, else_branch),
            Stmt::While { condition, body } => self.gen_while(condition, body),
            Stmt::For {
                init,
                condition,
                increment,
                body,
            } => self.gen_for(init.as_deref(), condition.as_ref(), increment.as_ref(), body),
            Stmt::Return(value) => self.gen_return(value.as_ref()),
            Stmt::Block(statements) => {
                self.require_function("a block")?;
                self.push_scope();
                for stmt in statements {
                    self.gen_statement(stmt)?;
                }
                self.pop_scope();
                Ok(())
            }
        }
    }

    fn gen_var_decl(
        &mut self,
        name: &str,
        ty: &str,
        init: Option<&Expr>,
        is_const: bool,
    ) -> CodegenResult<()> {
        let lowered = self.lower_type(ty);

        if self.current_fn.is_none() {
            // Top level: create a global. Only literal initializers are
            // evaluated as constants; everything else zero-initializes.
            let initializer = self.global_initializer(lowered, init);
            let global = self.module.add_global(lowered, None, name);
            global.set_initializer(&initializer);

            self.scopes[0].insert(
                name.to_string(),
                Binding {
                    storage: None,
                    ty: lowered,
                    type_name: ty.to_string(),
                    is_const,
                },
            );
            return Ok(());
        }

        // The slot lives in the entry block so storage is unconditional;
        // the initializing store happens at the textual position.
        let slot = self.create_entry_alloca(name, lowered)?;
        self.declare(
            name,
            Binding {
                storage: Some(slot),
                ty: lowered,
                type_name: ty.to_string(),
                is_const,
            },
        );

        if let Some(init) = init {
            let value = self.gen_expr(init)?.basic()?;
            let coerced = self.coerce(value, lowered)?;
            self.builder.build_store(slot, coerced)?;
        }

        Ok(())
    }

    fn global_initializer(
        &self,
        lowered: BasicTypeEnum<'ctx>,
        init: Option<&Expr>,
    ) -> BasicValueEnum<'ctx> {
        let literal_int = |value: i64| match lowered {
            BasicTypeEnum::IntType(int_ty) => int_ty.const_int(value as u64, true).into(),
            BasicTypeEnum::FloatType(float_ty) => float_ty.const_float(value as f64).into(),
            _ => lowered.const_zero(),
        };

        match init {
            Some(Expr::Int(value)) => literal_int(*value),
            Some(Expr::Unary {
                op: UnaryOp::Neg,
                operand,
            }) => match operand.as_ref() {
                Expr::Int(value) => literal_int(-value),
                _ => lowered.const_zero(),
            },
            Some(Expr::Float(value)) => match lowered {
                BasicTypeEnum::FloatType(float_ty) => float_ty.const_float(*value as f64).into(),
                _ => lowered.const_zero(),
            },
            Some(Expr::Bool(value)) => literal_int(*value as i64),
            Some(Expr::Char(value)) => literal_int(*value as i64),
            _ => lowered.const_zero(),
        }
    }

    fn gen_function(&mut self, decl: &FunctionDecl) -> CodegenResult<()> {
        // Exported symbols carry the module prefix; everything else keeps
        // its source name.
        let symbol = if decl.is_exported {
            format!("{}_{}", self.module_name, decl.name)
        } else {
            decl.name.clone()
        };

        let fn_type = self.function_type(&decl.params, &decl.return_type);
        let function = self.module.add_function(&symbol, fn_type, None);

        self.functions.insert(
            decl.name.clone(),
            FnSig {
                symbol,
                return_type: decl.return_type.clone(),
            },
        );

        if decl.is_exported {
            self.exports.functions.push(ExportedFunction {
                name: decl.name.clone(),
                params: decl.params.clone(),
                return_type: decl.return_type.clone(),
            });
        }

        if decl.is_external {
            return Ok(());
        }

        let entry = self.context.append_basic_block(function, "entry");
        self.builder.position_at_end(entry);
        self.current_fn = Some(function);
        self.push_scope();

        // Parameters are stored into stack slots so they resolve like any
        // other local.
        for (i, (param_name, param_type)) in decl.params.iter().enumerate() {
            let lowered = self.lower_type(param_type);
            let slot = self.create_entry_alloca(param_name, lowered)?;
            let argument = function.get_nth_param(i as u32).unwrap();
            self.builder.build_store(slot, argument)?;
            self.declare(
                param_name,
                Binding {
                    storage: Some(slot),
                    ty: lowered,
                    type_name: param_type.clone(),
                    is_const: false,
                },
            );
        }

        for stmt in &decl.body {
            self.gen_statement(stmt)?;
        }

        // Implicit return for void functions whose last block falls through.
        if decl.return_type == "void" {
            let block = self
                .builder
                .get_insert_block()
                .expect("builder is positioned inside the function");
            if block.get_terminator().is_none() {
                self.builder.build_return(None)?;
            }
        }

        self.pop_scope();
        self.current_fn = None;
        self.builder.clear_insertion_position();
        Ok(())
    }

    fn gen_struct_decl(&mut self, decl: &StructDecl) -> CodegenResult<()> {
        self.register_struct(&decl.name, &decl.fields);

        if decl.is_exported {
            self.exports.structs.push(ExportedStruct {
                name: decl.name.clone(),
                fields: decl.fields.clone(),
            });
        }

        Ok(())
    }

    fn gen_if(
        &mut self,
        condition: &Expr,
        then_branch: &[Stmt],
        else_branch: &[Stmt],
    ) -> CodegenResult<()> {
        let function = self.require_function("an if statement")?;

        let cond = self.gen_expr(condition)?.basic()?;
        let selector = self.truthify(cond)?;

        let then_block = self.context.append_basic_block(function, "then");
        let else_block = if else_branch.is_empty() {
            None
        } else {
            Some(self.context.append_basic_block(function, "else"))
        };
        let merge_block = self.context.append_basic_block(function, "ifend");

        self.builder.build_conditional_branch(
            selector,
            then_block,
            else_block.unwrap_or(merge_block),
        )?;

        self.builder.position_at_end(then_block);
        for stmt in then_branch {
            self.gen_statement(stmt)?;
        }
        // A branch that already returned must not jump to the merge block.
        if self.current_block_open() {
            self.builder.build_unconditional_branch(merge_block)?;
        }

        if let Some(else_block) = else_block {
            self.builder.position_at_end(else_block);
            for stmt in else_branch {
                self.gen_statement(stmt)?;
            }
            if self.current_block_open() {
                self.builder.build_unconditional_branch(merge_block)?;
            }
        }

        self.builder.position_at_end(merge_block);
        Ok(())
    }

    fn gen_while(&mut self, condition: &Expr, body: &[Stmt]) -> CodegenResult<()> {
        let function = self.require_function("a while loop")?;

        let cond_block = self.context.append_basic_block(function, "loopcond");
        let body_block = self.context.append_basic_block(function, "loopbody");
        let after_block = self.context.append_basic_block(function, "loopend");

        self.builder.build_unconditional_branch(cond_block)?;

        self.builder.position_at_end(cond_block);
        let cond = self.gen_expr(condition)?.basic()?;
        let selector = self.truthify(cond)?;
        self.builder
            .build_conditional_branch(selector, body_block, after_block)?;

        self.builder.position_at_end(body_block);
        for stmt in body {
            self.gen_statement(stmt)?;
        }
        if self.current_block_open() {
            self.builder.build_unconditional_branch(cond_block)?;
        }

        self.builder.position_at_end(after_block);
        Ok(())
    }

    fn gen_for(
        &mut self,
        init: Option<&Stmt>,
        condition: Option<&Expr>,
        increment: Option<&Expr>,
        body: &[Stmt],
    ) -> CodegenResult<()> {
        let function = self.require_function("a for loop")?;

        // The header's declaration lives in its own scope.
        self.push_scope();

        if let Some(init) = init {
            self.gen_statement(init)?;
        }

        let cond_block = self.context.append_basic_block(function, "forcond");
        let body_block = self.context.append_basic_block(function, "forbody");
        let inc_block = self.context.append_basic_block(function, "forinc");
        let after_block = self.context.append_basic_block(function, "forend");

        self.builder.build_unconditional_branch(cond_block)?;

        self.builder.position_at_end(cond_block);
        match condition {
            Some(condition) => {
                let cond = self.gen_expr(condition)?.basic()?;
                let selector = self.truthify(cond)?;
                self.builder
                    .build_conditional_branch(selector, body_block, after_block)?;
            }
            // An absent condition is always true.
            None => {
                self.builder.build_unconditional_branch(body_block)?;
            }
        }

        self.builder.position_at_end(body_block);
        for stmt in body {
            self.gen_statement(stmt)?;
        }
        if self.current_block_open() {
            self.builder.build_unconditional_branch(inc_block)?;
        }

        self.builder.position_at_end(inc_block);
        if let Some(increment) = increment {
            self.gen_expr(increment)?;
        }
        self.builder.build_unconditional_branch(cond_block)?;

        self.builder.position_at_end(after_block);
        self.pop_scope();
        Ok(())
    }

    fn gen_return(&mut self, value: Option<&Expr>) -> CodegenResult<()> {
        let function = self.require_function("a return statement")?;

        match value {
            Some(expr) => {
                let value = self.gen_expr(expr)?.basic()?;
                // Match the declared return width.
                let value = match function.get_type().get_return_type() {
                    Some(return_ty) => self.coerce(value, return_ty)?,
                    None => value,
                };
                self.builder.build_return(Some(&value))?;
            }
            None => {
                self.builder.build_return(None)?;
            }
        }
        Ok(())
    }

    /// Whether the block the builder sits in still lacks a terminator
    fn current_block_open(&self) -> bool {
        self.builder
            .get_insert_block()
            .map(|block| block.get_terminator().is_none())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    /// Lower a source string in a fresh context and return the printed IR;
    /// the module must verify.
    fn lower(source: &str) -> String {
        lower_named("test", source).expect("codegen should succeed")
    }

    fn lower_named(module_name: &str, source: &str) -> CodegenResult<String> {
        let (program, errors) = parser::parse(source);
        assert!(errors.is_empty(), "parse errors: {:?}", errors);

        let context = Context::create();
        let mut codegen = Codegen::new(&context, module_name, Path::new("."));
        codegen.generate(&program)?;
        codegen.verify().expect("module should verify");
        Ok(codegen.print_ir())
    }

    fn lower_err(source: &str) -> CodegenError {
        let (program, errors) = parser::parse(source);
        assert!(errors.is_empty(), "parse errors: {:?}", errors);

        let context = Context::create();
        let mut codegen = Codegen::new(&context, "test", Path::new("."));
        codegen
            .generate(&program)
            .expect_err("codegen should fail")
    }

    #[test]
    fn test_arithmetic() {
        // Operands come from memory so the instructions are not folded.
        let ir = lower("fun calc(a: i32, b: i32): i32 { let x: i32 = a + b * 4; return x; }");
        assert!(ir.contains("mul"));
        assert!(ir.contains("add"));
        assert!(ir.contains("define i32 @calc"));
    }

    #[test]
    fn test_literal_arithmetic_lowers_and_verifies() {
        let ir = lower("fun main(): i32 { let x: i32 = 2 + 3 * 4; return x; }");
        assert!(ir.contains("define i32 @main"));
        assert!(ir.contains("store i32"));
    }

    #[test]
    fn test_unsigned_division_uses_udiv() {
        let ir = lower(
            "fun main(): i32 { let a: u32 = 100; let b: u32 = 16; let q: u32 = a / b; return 0; }",
        );
        assert!(ir.contains("udiv"), "expected udiv in:\n{}", ir);
        assert!(!ir.contains("sdiv"), "unexpected sdiv in:\n{}", ir);
    }

    #[test]
    fn test_signed_division_uses_sdiv() {
        let ir = lower("fun main(): i32 { let a: i32 = 100; let q: i32 = a / 4; return q; }");
        assert!(ir.contains("sdiv"));
    }

    #[test]
    fn test_unsigned_comparison_uses_ult() {
        let ir = lower("fun f(a: u32, b: u32): bool { return a < b; }");
        assert!(ir.contains("icmp ult"));
    }

    #[test]
    fn test_exported_function_is_mangled() {
        let ir = lower_named("lib", "export fun add(a: i32, b: i32): i32 { return a + b; }")
            .unwrap();
        assert!(ir.contains("define i32 @lib_add("));
        assert!(!ir.contains("define i32 @add("));
    }

    #[test]
    fn test_unexported_function_keeps_its_name() {
        let ir = lower_named("lib", "fun helper(): i32 { return 1; }").unwrap();
        assert!(ir.contains("define i32 @helper("));
    }

    #[test]
    fn test_exports_are_recorded_in_order() {
        let (program, errors) = parser::parse(
            "export fun a() { } export struct P { x: i32; } export fun b() { }",
        );
        assert!(errors.is_empty());

        let context = Context::create();
        let mut codegen = Codegen::new(&context, "lib", Path::new("."));
        codegen.generate(&program).unwrap();

        let exports = codegen.exports();
        let names: Vec<_> = exports.functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(exports.structs[0].name, "P");
    }

    #[test]
    fn test_parameters_become_stack_slots() {
        let ir = lower("fun id(x: i32): i32 { return x; }");
        assert!(ir.contains("alloca i32"));
        assert!(ir.contains("store i32"));
    }

    #[test]
    fn test_void_function_gets_implicit_return() {
        let ir = lower("fun t() { let x: i32 = 1; }");
        assert!(ir.contains("ret void"));
    }

    #[test]
    fn test_pointers_roundtrip_through_memory() {
        let ir = lower("fun main(): i32 { let x: i32 = 7; let p: i32* = &x; *p = *p + 1; return x; }");
        assert!(ir.contains("load ptr"));
        assert!(ir.contains("store i32"));
    }

    #[test]
    fn test_struct_literal_and_member_access() {
        let ir = lower(
            "struct P { x: i32; y: i32; } \
             fun main(): i32 { let p: P = P { x: 3, y: 4 }; return p.x + p.y; }",
        );
        assert!(ir.contains("%P = type { i32, i32 }"));
        assert!(ir.contains("getelementptr inbounds %P"));
    }

    #[test]
    fn test_struct_fields_map_by_name_not_position() {
        // Fields given out of order still land on their declared indices.
        let ir = lower(
            "struct P { x: i32; y: i64; } \
             fun t(): i64 { let p: P = P { y: 2, x: 1 }; return p.y; }",
        );
        assert!(ir.contains("%P = type { i32, i64 }"));
    }

    #[test]
    fn test_member_access_through_pointer() {
        let ir = lower(
            "struct P { x: i32; y: i32; } \
             fun t(p: P*): i32 { return p.x; }",
        );
        assert!(ir.contains("getelementptr inbounds %P"));
    }

    #[test]
    fn test_boolean_results_are_widened_to_i8() {
        let ir = lower("fun t(a: i32, b: i32): bool { return a < b && b < 10; }");
        assert!(ir.contains("zext i1"));
    }

    #[test]
    fn test_condition_truthifies_i8() {
        let ir = lower("fun t(flag: bool): i32 { if (flag) { return 1; } return 0; }");
        assert!(ir.contains("icmp ne i8"));
    }

    #[test]
    fn test_while_loop_blocks() {
        let ir = lower("fun t(): i32 { let i: i32 = 0; while (i < 3) { i = i + 1; } return i; }");
        assert!(ir.contains("loopcond:"));
        assert!(ir.contains("loopbody:"));
        assert!(ir.contains("loopend:"));
    }

    #[test]
    fn test_for_loop_blocks() {
        let ir = lower(
            "fun t(): i32 { let s: i32 = 0; \
             for (let i: i32 = 0; i < 10; i = i + 1) { s = s + i; } return s; }",
        );
        assert!(ir.contains("forcond:"));
        assert!(ir.contains("forinc:"));
    }

    #[test]
    fn test_early_return_skips_merge_branch() {
        let ir = lower("fun t(x: i32): i32 { if (x < 0) { return 0; } return x; }");
        assert!(ir.contains("then:"));
    }

    #[test]
    fn test_global_variable_with_literal_initializer() {
        let ir = lower("let g: i32 = 5; fun main(): i32 { return g; }");
        assert!(ir.contains("@g = global i32 5"));
    }

    #[test]
    fn test_global_with_negative_initializer() {
        let ir = lower("let g: i32 = -3; fun main(): i32 { return g; }");
        assert!(ir.contains("@g = global i32 -3"));
    }

    #[test]
    fn test_string_literal_becomes_named_global() {
        let ir = lower("fun t(): char* { return \"hi\"; }");
        assert!(ir.contains(".str.0"));
    }

    #[test]
    fn test_malloc_scales_by_element_size() {
        let ir = lower("fun t(n: i32): i64* { let p: i64* = malloc<i64>(n); return p; }");
        assert!(ir.contains("declare ptr @malloc(i64)"));
        assert!(ir.contains("mul"));
        assert!(ir.contains("sext i32"));
    }

    #[test]
    fn test_free_lowering() {
        let ir = lower("fun t(p: i32*) { free(p); }");
        assert!(ir.contains("declare void @free(ptr)"));
    }

    #[test]
    fn test_malloc_free_roundtrip() {
        let ir = lower("fun t() { let p: i32* = malloc<i32>(1); *p = 42; free(p); }");
        assert!(ir.contains("call ptr @malloc"));
        assert!(ir.contains("call void @free"));
    }

    #[test]
    fn test_int_literal_coerces_to_wider_declared_type() {
        let ir = lower("fun t(): i64 { let x: i64 = 1; return x; }");
        assert!(ir.contains("store i64"));
    }

    #[test]
    fn test_extern_function_declares_without_body() {
        let ir = lower("extern fun putchar(c: i32): i32; fun t() { putchar(65); }");
        assert!(ir.contains("declare i32 @putchar(i32)"));
    }

    #[test]
    fn test_const_assignment_is_fatal_and_names_binding() {
        let err = lower_err("fun t() { const limit: i32 = 10; limit = 11; }");
        match err {
            CodegenError::ConstAssignment(name) => assert_eq!(name, "limit"),
            other => panic!("expected ConstAssignment, got {:?}", other),
        }
    }

    #[test]
    fn test_non_pointer_deref_is_fatal() {
        let err = lower_err("fun t() { let x: i32 = 1; let y: i32 = *x; }");
        assert!(matches!(err, CodegenError::NonPointerDeref(ty) if ty == "i32"));
    }

    #[test]
    fn test_undefined_variable_is_fatal() {
        let err = lower_err("fun t(): i32 { return nope; }");
        assert!(matches!(err, CodegenError::UndefinedVariable(name) if name == "nope"));
    }

    #[test]
    fn test_undefined_function_is_fatal() {
        let err = lower_err("fun t() { missing(); }");
        assert!(matches!(err, CodegenError::UndefinedFunction(name) if name == "missing"));
    }

    #[test]
    fn test_call_without_import_is_fatal() {
        let err = lower_err("fun t(): i32 { return lib.add(1, 2); }");
        assert!(matches!(err, CodegenError::UnknownModule(name) if name == "lib"));
    }

    #[test]
    fn test_struct_literal_field_count_mismatch_is_fatal() {
        let err = lower_err(
            "struct P { x: i32; y: i32; } fun t() { let p: P = P { x: 1 }; }",
        );
        assert!(matches!(err, CodegenError::FieldCountMismatch { expected: 2, got: 1, .. }));
    }

    #[test]
    fn test_unknown_field_is_fatal() {
        let err = lower_err(
            "struct P { x: i32; } fun t() { let p: P = P { z: 1 }; }",
        );
        assert!(matches!(err, CodegenError::UnknownField { field, .. } if field == "z"));
    }

    #[test]
    fn test_statement_outside_function_is_fatal() {
        let err = lower_err("return 1;");
        assert!(matches!(err, CodegenError::StatementOutsideFunction(_)));
    }

    #[test]
    fn test_qualified_call_through_metadata() {
        use crate::metadata::{ExportedFunction, ModuleMetadata};

        let dir = tempfile::tempdir().unwrap();
        let mut metadata = ModuleMetadata::new("lib");
        metadata.functions.push(ExportedFunction {
            name: "add".to_string(),
            params: vec![
                ("a".to_string(), "i32".to_string()),
                ("b".to_string(), "i32".to_string()),
            ],
            return_type: "i32".to_string(),
        });
        metadata.save(&dir.path().join("lib.racm")).unwrap();

        let (program, errors) =
            parser::parse("import \"lib\"; fun main(): i32 { return lib.add(2, 3); }");
        assert!(errors.is_empty());

        let context = Context::create();
        let mut codegen = Codegen::new(&context, "app", dir.path());
        codegen.generate(&program).unwrap();
        codegen.verify().unwrap();

        let ir = codegen.print_ir();
        assert!(ir.contains("call i32 @lib_add(i32 2, i32 3)"));
        assert!(ir.contains("declare i32 @lib_add(i32, i32)"));
    }

    #[test]
    fn test_imported_struct_is_materialized() {
        use crate::metadata::{ExportedStruct, ModuleMetadata};

        let dir = tempfile::tempdir().unwrap();
        let mut metadata = ModuleMetadata::new("geo");
        metadata.structs.push(ExportedStruct {
            name: "Point".to_string(),
            fields: vec![
                ("x".to_string(), "i32".to_string()),
                ("y".to_string(), "i32".to_string()),
            ],
        });
        metadata.save(&dir.path().join("geo.racm")).unwrap();

        let (program, errors) = parser::parse(
            "import \"geo\"; \
             fun main(): i32 { let p: Point = geo.Point { x: 1, y: 2 }; return p.x; }",
        );
        assert!(errors.is_empty());

        let context = Context::create();
        let mut codegen = Codegen::new(&context, "app", dir.path());
        codegen.generate(&program).unwrap();
        codegen.verify().unwrap();

        let ir = codegen.print_ir();
        assert!(ir.contains("%Point = type { i32, i32 }"));
    }

    #[test]
    fn test_logical_ops_do_not_short_circuit() {
        // Both operands are evaluated and combined bitwise.
        let ir = lower("fun t(a: i32, b: i32): bool { return a < 1 || b < 2; }");
        assert!(ir.contains("or i1"));
        assert!(!ir.contains("br i1 %tobool"));
    }

    #[test]
    fn test_float_promotion() {
        let ir = lower("fun t(x: f32, n: i32): f32 { return x + n; }");
        assert!(ir.contains("sitofp"));
        assert!(ir.contains("fadd"));
    }

    #[test]
    fn test_unsigned_int_promotes_via_uitofp() {
        let ir = lower("fun t(x: f32, n: u32): f32 { return x + n; }");
        assert!(ir.contains("uitofp"));
    }

    #[test]
    fn test_mixed_width_ints_sign_extend() {
        let ir = lower("fun t(a: i32, b: i64): i64 { return b + a; }");
        assert!(ir.contains("sext i32"));
    }
}
